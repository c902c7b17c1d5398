use std::fmt;
use std::str::FromStr;

/// A subscription destination on the real-time stream.
///
/// Team ids are project ids: each project owns exactly one team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    GlobalActivities,
    ProjectActivities(i64),
    TaskActivities(i64),
    UserNotifications(i64),
    TeamUpdates(i64),
}

impl Topic {
    pub fn destination(&self) -> String {
        match self {
            Self::GlobalActivities => "/topic/activities/global".to_string(),
            Self::ProjectActivities(id) => format!("/topic/activities/project/{}", id),
            Self::TaskActivities(id) => format!("/topic/activities/task/{}", id),
            Self::UserNotifications(id) => format!("/topic/notifications/user/{}", id),
            Self::TeamUpdates(id) => format!("/topic/teams/{}/updates", id),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.destination())
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("Invalid topic destination: {}", s);
        let parse_id = |raw: &str| raw.parse::<i64>().map_err(|_| invalid());

        let parts: Vec<&str> = s.trim_start_matches('/').split('/').collect();
        match parts.as_slice() {
            ["topic", "activities", "global"] => Ok(Self::GlobalActivities),
            ["topic", "activities", "project", id] => Ok(Self::ProjectActivities(parse_id(id)?)),
            ["topic", "activities", "task", id] => Ok(Self::TaskActivities(parse_id(id)?)),
            ["topic", "notifications", "user", id] => Ok(Self::UserNotifications(parse_id(id)?)),
            ["topic", "teams", id, "updates"] => Ok(Self::TeamUpdates(parse_id(id)?)),
            _ => Err(invalid()),
        }
    }
}
