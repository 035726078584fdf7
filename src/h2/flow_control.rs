//! HTTP/2 flow control windows (RFC 7540 Section 5.2)

use super::error::{EngineError, Result};
use super::DEFAULT_INITIAL_WINDOW_SIZE;

/// One direction of a flow-control window. The current size can go
/// negative after SETTINGS shrinks the initial size under data already in
/// flight.
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    initial_size: u32,
    current_size: i64,
}

const MAX_WINDOW: i64 = 0x7FFF_FFFF;

impl FlowControlWindow {
    pub fn new() -> Self {
        Self::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn with_initial_size(initial_size: u32) -> Self {
        FlowControlWindow {
            initial_size,
            current_size: i64::from(initial_size),
        }
    }

    pub fn size(&self) -> i64 {
        self.current_size
    }

    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    pub fn has_capacity(&self) -> bool {
        self.current_size > 0
    }

    /// Takes up to `amount` from the window; returns what was actually
    /// available.
    pub fn consume(&mut self, amount: usize) -> usize {
        if amount == 0 || self.current_size <= 0 {
            return 0;
        }
        let taken = (amount as i64).min(self.current_size) as usize;
        self.current_size -= taken as i64;
        taken
    }

    /// WINDOW_UPDATE: grows the window.
    pub fn increase(&mut self, increment: u32) -> Result<()> {
        if increment == 0 {
            return Err(EngineError::Protocol(
                "window update increment must be non-zero".to_string(),
            ));
        }
        let new_size = self.current_size + i64::from(increment);
        if new_size > MAX_WINDOW {
            return Err(EngineError::FlowControl(format!(
                "window size {} exceeds 2^31-1",
                new_size
            )));
        }
        self.current_size = new_size;
        Ok(())
    }

    /// Accounts received payload against the window.
    pub fn decrease(&mut self, amount: usize) -> Result<()> {
        let new_size = self.current_size - amount as i64;
        if new_size < -MAX_WINDOW {
            return Err(EngineError::FlowControl(
                "peer overran the flow-control window".to_string(),
            ));
        }
        self.current_size = new_size;
        Ok(())
    }

    /// SETTINGS_INITIAL_WINDOW_SIZE change: shifts the current window by
    /// the delta (RFC 7540 Section 6.9.2).
    pub fn update_initial_size(&mut self, new_initial_size: u32) -> Result<()> {
        let diff = i64::from(new_initial_size) - i64::from(self.initial_size);
        let new_current = self.current_size + diff;
        if new_current > MAX_WINDOW {
            return Err(EngineError::FlowControl(format!(
                "window size {} exceeds 2^31-1",
                new_current
            )));
        }
        self.initial_size = new_initial_size;
        self.current_size = new_current;
        Ok(())
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_caps_at_window() {
        let mut w = FlowControlWindow::with_initial_size(100);
        assert_eq!(w.consume(60), 60);
        assert_eq!(w.consume(60), 40);
        assert_eq!(w.consume(10), 0);
        assert!(!w.has_capacity());
    }

    #[test]
    fn test_increase_and_overflow() {
        let mut w = FlowControlWindow::with_initial_size(100);
        w.increase(50).unwrap();
        assert_eq!(w.size(), 150);

        assert!(w.increase(0).is_err());

        let mut w = FlowControlWindow::with_initial_size(0x7FFF_FFFF);
        assert!(w.increase(1).is_err());
    }

    #[test]
    fn test_initial_size_update_shifts_current() {
        let mut w = FlowControlWindow::with_initial_size(1000);
        w.consume(600);
        assert_eq!(w.size(), 400);

        // Shrinking under in-flight data may drive the window negative.
        w.update_initial_size(100).unwrap();
        assert_eq!(w.size(), -500);

        w.update_initial_size(1000).unwrap();
        assert_eq!(w.size(), 400);
    }
}
