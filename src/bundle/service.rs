//! Service records and the metadata overlay
//!
//! A bundle stores each service as a raw document ([`ServiceEntry`]) whose
//! unrecognized keys pass through untouched. Consumers read services through
//! the derived [`ServiceSpec`] view, which combines the raw entry with the
//! optional per-service [`ServiceMeta`] overlay and the subset of the
//! topology's relations that mention the service.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value as YamlValue;
use tracing::warn;

use crate::bundle::Relation;

/// Placement kinds a service's units may be assigned with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentType {
    BareMetal,
    Kvm,
    Lxd,
    Lxc,
}

impl AssignmentType {
    pub const ALL: [AssignmentType; 4] = [
        AssignmentType::BareMetal,
        AssignmentType::Kvm,
        AssignmentType::Lxd,
        AssignmentType::Lxc,
    ];

    /// Normalize a string label to an assignment type
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "baremetal" | "bare" | "metal" => Some(AssignmentType::BareMetal),
            "kvm" => Some(AssignmentType::Kvm),
            "lxd" => Some(AssignmentType::Lxd),
            "lxc" => Some(AssignmentType::Lxc),
            _ => None,
        }
    }

    /// Placement-target prefix used in `to` entries (`kvm:0`, `lxd:2`, ...)
    pub fn placement_prefix(self) -> &'static str {
        match self {
            AssignmentType::BareMetal => "",
            AssignmentType::Kvm => "kvm:",
            AssignmentType::Lxd => "lxd:",
            AssignmentType::Lxc => "lxc:",
        }
    }
}

/// Raw per-service document from a bundle's `services` section
///
/// Keys are lowercased on load; anything the model does not interpret is kept
/// in `rest` and round-trips through serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ServiceEntry {
    #[serde(default)]
    pub charm: String,

    /// Unit count; `numunits` is accepted as a charm store v4 spelling.
    /// Absent means zero, which marks the service subordinate.
    #[serde(default, alias = "numunits", skip_serializing_if = "Option::is_none")]
    pub num_units: Option<u64>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, YamlValue>,

    /// Placement targets; accepts a single scalar or a sequence, and
    /// tolerates bare machine ids written as YAML integers.
    #[serde(
        default,
        deserialize_with = "deserialize_placement",
        skip_serializing_if = "Option::is_none"
    )]
    pub to: Option<Vec<String>>,

    #[serde(flatten)]
    pub rest: BTreeMap<String, YamlValue>,
}

impl ServiceEntry {
    /// Effective unit count (absent counts as zero)
    pub fn units(&self) -> u64 {
        self.num_units.unwrap_or(0)
    }
}

fn deserialize_placement<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<YamlValue>::deserialize(deserializer)?;
    match value {
        None | Some(YamlValue::Null) => Ok(None),
        Some(v) => placement_list(&v)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("'to' must be a scalar or list of scalars")),
    }
}

fn placement_list(value: &YamlValue) -> Option<Vec<String>> {
    match value {
        YamlValue::String(s) => Some(vec![s.clone()]),
        YamlValue::Number(n) => Some(vec![n.to_string()]),
        YamlValue::Sequence(seq) => seq
            .iter()
            .map(|item| match item {
                YamlValue::String(s) => Some(s.clone()),
                YamlValue::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

fn default_true() -> bool {
    true
}

/// Per-service deployment metadata from the overlay document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceMeta {
    pub constraints: BTreeMap<String, YamlValue>,
    pub depends: Vec<String>,
    pub conflicts: Vec<String>,

    /// Assignment-type labels; unrecognized labels are dropped with a warning
    pub allowed_assignment_types: Option<Vec<String>>,

    #[serde(default = "default_true")]
    pub allow_multi_units: bool,

    #[serde(default = "default_true")]
    pub required: bool,
}

impl Default for ServiceMeta {
    fn default() -> Self {
        ServiceMeta {
            constraints: BTreeMap::new(),
            depends: Vec::new(),
            conflicts: Vec::new(),
            allowed_assignment_types: None,
            allow_multi_units: true,
            required: true,
        }
    }
}

impl ServiceMeta {
    /// Resolve the allowed assignment types, defaulting to all kinds
    pub fn assignment_types(&self) -> Vec<AssignmentType> {
        match &self.allowed_assignment_types {
            None => AssignmentType::ALL.to_vec(),
            Some(labels) => labels
                .iter()
                .filter_map(|label| {
                    let atype = AssignmentType::from_label(label);
                    if atype.is_none() {
                        warn!(label, "ignoring unknown assignment type label");
                    }
                    atype
                })
                .collect(),
        }
    }
}

/// Derived view of one deployable service within a topology
///
/// Built on access from the raw [`ServiceEntry`], the overlay
/// [`ServiceMeta`], and the relations that mention the service; never cached.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    pub service_name: String,
    pub charm_source: String,
    /// Charm name derived from the source id (revision and series stripped)
    pub charm_name: String,
    pub num_units: u64,
    /// Subordinate services deploy zero units of their own
    pub subordinate: bool,
    pub options: BTreeMap<String, YamlValue>,
    pub constraints: BTreeMap<String, YamlValue>,
    pub depends: Vec<String>,
    pub conflicts: Vec<String>,
    pub allowed_assignment_types: Vec<AssignmentType>,
    pub allow_multi_units: bool,
    pub required: bool,
    /// Placement targets from the raw entry's `to` list
    pub placement: Option<Vec<String>>,
    /// Relations whose either endpoint names this service
    pub relations: Vec<Relation>,
}

impl ServiceSpec {
    pub(crate) fn build(
        name: &str,
        entry: &ServiceEntry,
        meta: &ServiceMeta,
        relations: &[Relation],
    ) -> Self {
        let my_relations = relations
            .iter()
            .filter(|r| r.mentions(name))
            .cloned()
            .collect();
        let num_units = entry.units();
        ServiceSpec {
            service_name: name.to_string(),
            charm_source: entry.charm.clone(),
            charm_name: crate::charm::CharmStoreId::parse(&entry.charm).name().to_string(),
            num_units,
            subordinate: num_units == 0,
            options: entry.options.clone(),
            constraints: meta.constraints.clone(),
            depends: meta.depends.clone(),
            conflicts: meta.conflicts.clone(),
            allowed_assignment_types: meta.assignment_types(),
            allow_multi_units: meta.allow_multi_units,
            required: meta.required,
            placement: entry.to.clone(),
            relations: my_relations,
        }
    }
}
