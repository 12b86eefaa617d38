//! Campaign send windows.
//!
//! A campaign's `send_interval` restricts dispatch to an hour-of-day window
//! in UTC. The accepted grammar is exactly `HH:MM-HH:MM`; an end before the
//! start wraps past midnight. Anything else is rejected at pipe creation.

use lettermill_common::{Error, Result};

/// Parsed hour-of-day send window, minutes since midnight UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWindow {
    start: u16,
    end: u16,
}

impl SendWindow {
    /// Parse a `HH:MM-HH:MM` window string.
    pub fn parse(s: &str) -> Result<Self> {
        let (start, end) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| invalid(s))?;

        Ok(Self {
            start: parse_hhmm(start).ok_or_else(|| invalid(s))?,
            end: parse_hhmm(end).ok_or_else(|| invalid(s))?,
        })
    }

    /// Whether the given minute-of-day (UTC) falls inside the window.
    /// Start is inclusive, end exclusive. A window whose end precedes its
    /// start wraps midnight; start == end means the whole day.
    pub fn contains_minute(&self, minute_of_day: u16) -> bool {
        if self.start == self.end {
            return true;
        }
        if self.start < self.end {
            self.start <= minute_of_day && minute_of_day < self.end
        } else {
            minute_of_day >= self.start || minute_of_day < self.end
        }
    }
}

fn parse_hhmm(s: &str) -> Option<u16> {
    let (h, m) = s.trim().split_once(':')?;
    if h.len() != 2 || m.len() != 2 {
        return None;
    }

    let h: u16 = h.parse().ok()?;
    let m: u16 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }

    Some(h * 60 + m)
}

fn invalid(s: &str) -> Error {
    Error::Validation(format!(
        "invalid send_interval '{}', expected HH:MM-HH:MM",
        s
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let w = SendWindow::parse("09:00-17:30").unwrap();
        assert!(w.contains_minute(9 * 60));
        assert!(w.contains_minute(12 * 60 + 15));
        assert!(!w.contains_minute(17 * 60 + 30));
        assert!(!w.contains_minute(8 * 60 + 59));
    }

    #[test]
    fn test_parse_wrapping_window() {
        let w = SendWindow::parse("22:00-06:00").unwrap();
        assert!(w.contains_minute(23 * 60));
        assert!(w.contains_minute(60));
        assert!(!w.contains_minute(12 * 60));
    }

    #[test]
    fn test_equal_bounds_is_whole_day() {
        let w = SendWindow::parse("00:00-00:00").unwrap();
        assert!(w.contains_minute(0));
        assert!(w.contains_minute(23 * 60 + 59));
    }

    #[test]
    fn test_rejects_other_grammars() {
        assert!(SendWindow::parse("9:00-17:00").is_err());
        assert!(SendWindow::parse("09:00").is_err());
        assert!(SendWindow::parse("0 9 * * *").is_err());
        assert!(SendWindow::parse("25:00-26:00").is_err());
        assert!(SendWindow::parse("09:61-17:00").is_err());
        assert!(SendWindow::parse("").is_err());
    }
}
