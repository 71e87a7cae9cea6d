use serde::{Deserialize, Serialize};

macro_rules! newtype_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new_v4() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

newtype_id!(UserId);
newtype_id!(ContactId);
newtype_id!(CampaignId);
newtype_id!(MessageLogId);
newtype_id!(InstanceId);

/// DB には snake_case の文字列で保存される状態値を定義する。
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(ContactStatus {
    Active => "active",
    Unsubscribed => "unsubscribed",
});

text_enum!(CampaignStatus {
    Scheduled => "scheduled",
    InProgress => "in_progress",
    Paused => "paused",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

text_enum!(MessageStatus {
    Pending => "pending",
    Sent => "sent",
    Failed => "failed",
    Blocked => "blocked",
});

text_enum!(InstanceStatus {
    Pending => "pending",
    Connected => "connected",
    Disconnected => "disconnected",
});

impl CampaignStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// この状態へ遷移できる元の状態
    pub fn allowed_sources(self) -> &'static [CampaignStatus] {
        use CampaignStatus::*;
        match self {
            Scheduled => &[],
            InProgress => &[Scheduled, Paused],
            Paused => &[InProgress],
            Completed => &[InProgress],
            Failed => &[Scheduled, InProgress, Paused],
            Cancelled => &[Scheduled, InProgress, Paused],
        }
    }

    pub fn can_transition_to(self, next: CampaignStatus) -> bool {
        next.allowed_sources().contains(&self)
    }
}
