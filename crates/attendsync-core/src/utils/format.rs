use chrono::{DateTime, Local, Utc};

/// Truncate a string to a maximum length, adding ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let truncated: String = s.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    }
}

/// Format a timestamp in local time: "Sep 01, 2024 18:30"
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%b %d, %Y %H:%M").to_string()
}

/// Render an age in minutes the way cache ages are shown: "just now", "5m ago",
/// "2h ago", "3d ago". Rounds up at the half unit.
pub fn format_age_minutes(minutes: i64) -> String {
    if minutes < 1 {
        // Clock skew lands here too
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        if minutes % 60 >= 30 {
            format!("{}h ago", hours + 1)
        } else {
            format!("{}h ago", hours)
        }
    } else {
        let days = minutes / 1440;
        if (minutes % 1440) / 60 >= 12 {
            format!("{}d ago", days + 1)
        } else {
            format!("{}d ago", days)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("Hello", 10), "Hello");
        assert_eq!(truncate_string("Hello World", 8), "Hello...");
        assert_eq!(truncate_string("Hi", 2), "Hi");
        assert_eq!(truncate_string("Hello", 2), "He");
    }

    #[test]
    fn test_format_age_minutes() {
        assert_eq!(format_age_minutes(-4), "just now");
        assert_eq!(format_age_minutes(0), "just now");
        assert_eq!(format_age_minutes(5), "5m ago");
        assert_eq!(format_age_minutes(89), "1h ago");
        assert_eq!(format_age_minutes(90), "2h ago");
        assert_eq!(format_age_minutes(1440 + 11 * 60), "1d ago");
        assert_eq!(format_age_minutes(1440 + 12 * 60), "2d ago");
    }
}
