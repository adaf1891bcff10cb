//! Account-to-(cluster, queue) resolution.
//!
//! Every job is charged to an account; the account decides which cluster the
//! job counts against and which queue within it. Some clusters route by the
//! job's requested QOS instead, but only for jobs owned by a given server.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::record::Cluster;

/// Where jobs charged to one account are counted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRoute {
    /// Cluster name.
    pub cluster: String,
    /// Fixed queue name. When absent, the account name lower-cased is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

impl AccountRoute {
    fn fixed(cluster: &str, queue: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            queue: Some(queue.to_string()),
        }
    }

    fn by_account(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            queue: None,
        }
    }
}

/// Route a cluster's jobs by their requested QOS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosRule {
    /// Cluster the rule applies to.
    pub cluster: String,
    /// The rule fires only for jobs whose server name ends with this.
    pub server_suffix: String,
    /// Queue used when the job requested no QOS.
    pub default_queue: String,
}

/// Immutable mapping used by the record parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountMap {
    /// Account name to route.
    pub accounts: BTreeMap<String, AccountRoute>,
    /// QOS overrides, first match wins.
    #[serde(default)]
    pub qos_rules: Vec<QosRule>,
}

impl Default for AccountMap {
    fn default() -> Self {
        let mut accounts = BTreeMap::new();
        accounts.insert("cyberlamp".to_string(), AccountRoute::fixed("cyberlamp", "default"));
        for account in ["dfc13_a_g_sc_default", "dfc13_a_t_bc_default", "open"] {
            accounts.insert(account.to_string(), AccountRoute::by_account("aci"));
        }
        Self {
            accounts,
            qos_rules: vec![QosRule {
                cluster: "cyberlamp".to_string(),
                server_suffix: "aci.ics.psu.edu".to_string(),
                default_queue: "default".to_string(),
            }],
        }
    }
}

impl AccountMap {
    /// Resolve a job's (cluster, queue), or `None` for an unmapped account.
    pub fn resolve(&self, account: &str, server: &str, qos: Option<&str>) -> Option<(Cluster, String)> {
        let route = self.accounts.get(account)?;
        let mut queue = match &route.queue {
            Some(queue) => queue.clone(),
            None => account.to_lowercase(),
        };

        if let Some(rule) = self
            .qos_rules
            .iter()
            .find(|rule| rule.cluster == route.cluster && server.ends_with(&rule.server_suffix))
        {
            queue = qos.map_or_else(|| rule.default_queue.clone(), str::to_string);
        }

        Some((Cluster::new(route.cluster.clone()), queue))
    }

    /// Number of mapped accounts.
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Whether no account is mapped.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_routes() {
        let map = AccountMap::default();

        let (cluster, queue) = map.resolve("open", "torque01.example.org", None).unwrap();
        assert_eq!(cluster.as_str(), "aci");
        assert_eq!(queue, "open");

        let (cluster, queue) = map
            .resolve("dfc13_a_g_sc_default", "torque01.example.org", None)
            .unwrap();
        assert_eq!(cluster.as_str(), "aci");
        assert_eq!(queue, "dfc13_a_g_sc_default");

        let (cluster, queue) = map.resolve("cyberlamp", "torque01.example.org", Some("cl_gpu")).unwrap();
        assert_eq!(cluster.as_str(), "cyberlamp");
        assert_eq!(queue, "default");
    }

    #[test]
    fn test_qos_rule_applies_on_matching_server() {
        let map = AccountMap::default();

        let (_, queue) = map
            .resolve("cyberlamp", "pbs.aci.ics.psu.edu", Some("cl_gpu"))
            .unwrap();
        assert_eq!(queue, "cl_gpu");

        let (_, queue) = map.resolve("cyberlamp", "pbs.aci.ics.psu.edu", None).unwrap();
        assert_eq!(queue, "default");

        // QOS rules are per cluster.
        let (_, queue) = map.resolve("open", "pbs.aci.ics.psu.edu", Some("cl_gpu")).unwrap();
        assert_eq!(queue, "open");
    }

    #[test]
    fn test_unknown_account() {
        let map = AccountMap::default();
        assert!(map.resolve("mystery", "srv", None).is_none());
        assert!(map.resolve("OPEN", "srv", None).is_none());
    }

    #[test]
    fn test_deserialize_from_yaml() {
        let yaml = r#"
accounts:
  lab_a:
    cluster: gpu
    queue: batch
  Lab_B:
    cluster: gpu
"#;
        let map: AccountMap = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(map.qos_rules.is_empty());
        assert_eq!(map.len(), 2);
        let (_, queue) = map.resolve("Lab_B", "srv", None).unwrap();
        assert_eq!(queue, "lab_b");
        let (_, queue) = map.resolve("lab_a", "srv", None).unwrap();
        assert_eq!(queue, "batch");
    }
}
