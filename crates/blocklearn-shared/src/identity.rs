use serde::{Deserialize, Serialize};

/// A platform user as handed to the engine by the hosting page.
///
/// The engine never owns or mutates identities: `id` is used as the
/// correlation key (two identities are the same peer when their ids match)
/// and the name fields only as display labels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Identity {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

impl Identity {
    pub fn new(
        id: impl Into<String>,
        email: impl Into<String>,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            first_name: first_name.into(),
            last_name: last_name.into(),
        }
    }

    /// Whether `other` refers to the same platform user.
    pub fn same_as(&self, other: &Identity) -> bool {
        self.id == other.id
    }

    /// "First Last", falling back to the email when no name is known.
    pub fn display_name(&self) -> String {
        let name = format!("{} {}", self.first_name, self.last_name);
        let name = name.trim();
        if name.is_empty() {
            self.email.clone()
        } else {
            name.to_string()
        }
    }

    pub fn sender_info(&self) -> SenderInfo {
        SenderInfo {
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            email: Some(self.email.clone()),
        }
    }
}

/// Display fields attached to a chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SenderInfo {
    pub first_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl SenderInfo {
    pub fn system() -> Self {
        Self {
            first_name: "System".to_string(),
            last_name: String::new(),
            email: None,
        }
    }
}

/// Which side of a session the local peer is on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Mentor,
    Learner,
    Admin,
}

impl Role {
    /// Whether this role rates a session once it is completed.
    pub fn rates_sessions(&self) -> bool {
        matches!(self, Role::Learner)
    }

    /// Whether this role persists accepted proposals as durable sessions.
    pub fn records_sessions(&self) -> bool {
        matches!(self, Role::Mentor)
    }

    pub fn counterpart_label(&self) -> &'static str {
        match self {
            Role::Mentor => "Student",
            Role::Learner => "Mentor",
            Role::Admin => "Candidate",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Mentor => write!(f, "mentor"),
            Role::Learner => write!(f, "learner"),
            Role::Admin => write!(f, "admin"),
        }
    }
}
