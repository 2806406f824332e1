use serde::{Deserialize, Serialize};

/// Reporting window accepted by `GET /dashboard`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeRange {
    #[default]
    Today,
    Week,
    Month,
    AllTime,
}

impl TimeRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeRange::Today => "today",
            TimeRange::Week => "week",
            TimeRange::Month => "month",
            TimeRange::AllTime => "all_time",
        }
    }
}

impl std::str::FromStr for TimeRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "today" => Ok(TimeRange::Today),
            "week" => Ok(TimeRange::Week),
            "month" => Ok(TimeRange::Month),
            "all_time" | "all" => Ok(TimeRange::AllTime),
            other => Err(format!("Unknown time range: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardStats {
    #[serde(default)]
    pub total_registered_users: Option<u64>,
    #[serde(default)]
    pub unique_attendees: u64,
    #[serde(default)]
    pub fingerprint_checkins: u64,
    #[serde(default)]
    pub qr_checkins: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dashboard {
    #[serde(default)]
    pub stats: DashboardStats,
}

impl Dashboard {
    /// Check-in rate as a rounded percentage.
    ///
    /// When the server omits `total_registered_users`, `known_users` (usually
    /// the length of the cached `/users` list) is used as the denominator.
    pub fn checkin_rate(&self, known_users: u64) -> u64 {
        let total = self.stats.total_registered_users.unwrap_or(known_users);
        let checked_in = self.stats.unique_attendees;
        if total == 0 || checked_in == 0 {
            return 0;
        }
        ((checked_in as f64 / total as f64) * 100.0).round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkin_rate_uses_server_total() {
        let dashboard = Dashboard {
            stats: DashboardStats {
                total_registered_users: Some(40),
                unique_attendees: 10,
                ..Default::default()
            },
        };
        assert_eq!(dashboard.checkin_rate(999), 25);
    }

    #[test]
    fn test_checkin_rate_falls_back_to_known_users() {
        let dashboard = Dashboard {
            stats: DashboardStats {
                total_registered_users: None,
                unique_attendees: 2,
                ..Default::default()
            },
        };
        assert_eq!(dashboard.checkin_rate(3), 67);
        assert_eq!(dashboard.checkin_rate(0), 0);
    }

    #[test]
    fn test_time_range_parse() {
        assert_eq!("week".parse::<TimeRange>().unwrap(), TimeRange::Week);
        assert_eq!("all".parse::<TimeRange>().unwrap(), TimeRange::AllTime);
        assert!("fortnight".parse::<TimeRange>().is_err());
        assert_eq!(TimeRange::AllTime.as_str(), "all_time");
    }
}
