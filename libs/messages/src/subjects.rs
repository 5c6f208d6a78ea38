//! Subject naming for one service namespace.

use fleet_id::NodeId;

/// Builds bus subjects for a single service namespace (e.g. `kv`, `mq`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subjects {
    service: String,
}

impl Subjects {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn discover(&self) -> String {
        format!("{}.discover", self.service)
    }

    pub fn announce(&self) -> String {
        format!("{}.announce", self.service)
    }

    pub fn provision(&self, node_id: &NodeId) -> String {
        format!("{}.provision.{}", self.service, node_id)
    }

    pub fn unprovision(&self, node_id: &NodeId) -> String {
        format!("{}.unprovision.{}", self.service, node_id)
    }

    pub fn bind(&self, node_id: &NodeId) -> String {
        format!("{}.bind.{}", self.service, node_id)
    }

    pub fn unbind(&self, node_id: &NodeId) -> String {
        format!("{}.unbind.{}", self.service, node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subjects_embed_node_id() {
        let subjects = Subjects::new("kv");
        let node = NodeId::new();

        assert_eq!(subjects.discover(), "kv.discover");
        assert_eq!(subjects.announce(), "kv.announce");
        assert_eq!(subjects.provision(&node), format!("kv.provision.{node}"));
        assert_eq!(subjects.unprovision(&node), format!("kv.unprovision.{node}"));
        assert_eq!(subjects.bind(&node), format!("kv.bind.{node}"));
        assert_eq!(subjects.unbind(&node), format!("kv.unbind.{node}"));
    }
}
