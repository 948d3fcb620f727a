use shared::error::{SyncError, SyncResult};

/// Collection-name overrides for deployments that do not use the default
/// layout. Messages and memberships live under their session document:
/// `<sessions>/<session id>/<messages>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionNames {
    pub sessions: String,
    pub messages: String,
    pub activity: String,
    pub members: String,
    pub profiles: String,
}

impl Default for CollectionNames {
    fn default() -> Self {
        Self {
            sessions: "sessions".into(),
            messages: "messages".into(),
            activity: "activity".into(),
            members: "members".into(),
            profiles: "profiles".into(),
        }
    }
}

/// Store layout configuration, validated once at engine construction rather
/// than at first use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreConfig {
    pub names: CollectionNames,
    /// Optional path prefix for multi-tenant deployments, e.g. `tenants/acme`.
    pub prefix: Option<String>,
}

impl StoreConfig {
    pub fn validate(&self) -> SyncResult<()> {
        let names = [
            ("sessions", &self.names.sessions),
            ("messages", &self.names.messages),
            ("activity", &self.names.activity),
            ("members", &self.names.members),
            ("profiles", &self.names.profiles),
        ];
        for (label, name) in names {
            validate_segment(label, name)?;
        }
        if let Some(prefix) = &self.prefix {
            for segment in prefix.split('/') {
                validate_segment("prefix", segment)?;
            }
        }
        Ok(())
    }

    pub fn sessions(&self) -> String {
        self.scoped(&self.names.sessions)
    }

    pub fn messages(&self, session_id: &str) -> String {
        format!("{}/{}/{}", self.sessions(), session_id, self.names.messages)
    }

    pub fn members(&self, session_id: &str) -> String {
        format!("{}/{}/{}", self.sessions(), session_id, self.names.members)
    }

    pub fn activity(&self) -> String {
        self.scoped(&self.names.activity)
    }

    pub fn profiles(&self) -> String {
        self.scoped(&self.names.profiles)
    }

    fn scoped(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{name}"),
            None => name.to_owned(),
        }
    }
}

fn validate_segment(label: &str, segment: &str) -> SyncResult<()> {
    if segment.trim().is_empty() {
        return Err(SyncError::invalid_argument(format!(
            "{label} collection name must not be empty"
        )));
    }
    if segment.contains('/') || segment.chars().any(char::is_whitespace) {
        return Err(SyncError::invalid_argument(format!(
            "{label} collection name '{segment}' must not contain '/' or whitespace"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_valid() {
        StoreConfig::default().validate().expect("default config");
    }

    #[test]
    fn rejects_empty_collection_name() {
        let mut config = StoreConfig::default();
        config.names.messages = "  ".into();
        assert!(matches!(
            config.validate(),
            Err(SyncError::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_separator_in_collection_name() {
        let mut config = StoreConfig::default();
        config.names.sessions = "chat/sessions".into();
        assert!(matches!(
            config.validate(),
            Err(SyncError::InvalidArgument(_))
        ));
    }

    #[test]
    fn prefix_segments_are_validated() {
        let config = StoreConfig {
            prefix: Some("tenants/ ".into()),
            ..StoreConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SyncError::InvalidArgument(_))
        ));
    }

    #[test]
    fn paths_compose_prefix_and_overrides() {
        let config = StoreConfig {
            names: CollectionNames {
                sessions: "rooms".into(),
                ..CollectionNames::default()
            },
            prefix: Some("tenants/acme".into()),
        };
        config.validate().expect("config");
        assert_eq!(config.sessions(), "tenants/acme/rooms");
        assert_eq!(config.messages("s1"), "tenants/acme/rooms/s1/messages");
        assert_eq!(config.activity(), "tenants/acme/activity");
    }
}
