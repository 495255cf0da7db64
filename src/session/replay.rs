/// 64-entry sliding window over received record sequence numbers.
#[derive(Debug, Default, Clone)]
pub struct ReplayWindow {
    highest: Option<u64>,
    seen: u64,
}

impl ReplayWindow {
    pub const SIZE: u64 = 64;

    pub fn new() -> Self {
        Self::default()
    }

    /// True if `sequence` has not been accepted and is not too old.
    pub fn is_fresh(&self, sequence: u64) -> bool {
        match self.highest {
            None => true,
            Some(highest) if sequence > highest => true,
            Some(highest) => {
                let age = highest - sequence;
                age < Self::SIZE && self.seen & (1u64 << age) == 0
            }
        }
    }

    /// Records `sequence`; call only after the record authenticated.
    pub fn mark(&mut self, sequence: u64) {
        match self.highest {
            None => {
                self.highest = Some(sequence);
                self.seen = 1;
            }
            Some(highest) if sequence > highest => {
                let shift = sequence - highest;
                self.seen = if shift >= Self::SIZE { 0 } else { self.seen << shift };
                self.seen |= 1;
                self.highest = Some(sequence);
            }
            Some(highest) => {
                let age = highest - sequence;
                if age < Self::SIZE {
                    self.seen |= 1u64 << age;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_are_rejected() {
        let mut window = ReplayWindow::new();
        assert!(window.is_fresh(0));
        window.mark(0);
        assert!(!window.is_fresh(0));
        assert!(window.is_fresh(1));
    }

    #[test]
    fn reordered_records_inside_window_are_accepted_once() {
        let mut window = ReplayWindow::new();
        window.mark(10);
        assert!(window.is_fresh(7));
        window.mark(7);
        assert!(!window.is_fresh(7));
        assert!(window.is_fresh(8));
    }

    #[test]
    fn records_older_than_window_are_rejected() {
        let mut window = ReplayWindow::new();
        window.mark(100);
        assert!(!window.is_fresh(100 - ReplayWindow::SIZE));
        assert!(window.is_fresh(100 - ReplayWindow::SIZE + 1));
    }

    #[test]
    fn large_jump_clears_history() {
        let mut window = ReplayWindow::new();
        window.mark(1);
        window.mark(1_000);
        assert!(!window.is_fresh(1_000));
        assert!(window.is_fresh(999));
    }
}
