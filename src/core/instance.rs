use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one running application instance.
///
/// Generated once per process lifetime of a coordinator/service pair; tags
/// outgoing broadcast messages and the shared last-save entry so foreign
/// activity can be told apart from our own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(InstanceId::generate(), InstanceId::generate());
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = InstanceId::generate();
        let text = serde_json::to_string(&id).unwrap();
        let back: InstanceId = serde_json::from_str(&text).unwrap();
        assert_eq!(id, back);
    }
}
