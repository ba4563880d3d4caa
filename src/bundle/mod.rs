//! Bundle topology model
//!
//! A [`Bundle`] is the in-memory form of a deployment topology document:
//! services, machines, relations, and any other top-level keys carried
//! through opaquely. Construction normalizes key case and validates that a
//! `services` section exists; everything else is permissive.
//!
//! The structural merge algorithm lives in [`merge`]; derived per-service
//! views live in [`service`].

pub mod merge;
pub mod service;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;
use tracing::debug;

use crate::charm::DEFAULT_SERIES;
use crate::error::{BundleError, Result};

pub use merge::MergeOutcome;
pub use service::{AssignmentType, ServiceEntry, ServiceMeta, ServiceSpec};

/// Opaque machine description (series override, constraints, ...)
pub type MachineSpec = BTreeMap<String, YamlValue>;

/// An ordered pair of relation endpoints
///
/// Each endpoint is `service` or `service:relation-name`. Endpoint order is
/// preserved for output fidelity but carries no meaning for matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation(pub String, pub String);

impl Relation {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        Relation(a.into(), b.into())
    }

    /// The service segment of an endpoint (everything before the first `:`)
    pub fn endpoint_service(endpoint: &str) -> &str {
        endpoint.split(':').next().unwrap_or(endpoint)
    }

    /// Whether either endpoint's service segment equals `service`
    pub fn mentions(&self, service: &str) -> bool {
        Relation::endpoint_service(&self.0) == service
            || Relation::endpoint_service(&self.1) == service
    }

    fn is_pair(&self, a: &str, b: &str) -> bool {
        self.0 == a && self.1 == b
    }
}

/// A deployment topology: services, machines, relations, and passthrough keys
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    pub(crate) services: BTreeMap<String, ServiceEntry>,
    pub(crate) machines: BTreeMap<String, MachineSpec>,
    pub(crate) relations: Vec<Relation>,
    /// Every top-level key other than services/machines/relations,
    /// including `series`
    pub(crate) extras: BTreeMap<String, YamlValue>,
    /// Per-service metadata overlay; not part of the bundle document
    pub(crate) meta: BTreeMap<String, ServiceMeta>,
}

impl Bundle {
    /// An empty bundle with the default series
    pub fn empty() -> Self {
        let mut extras = BTreeMap::new();
        extras.insert(
            "series".to_string(),
            YamlValue::String(DEFAULT_SERIES.to_string()),
        );
        Bundle {
            services: BTreeMap::new(),
            machines: BTreeMap::new(),
            relations: Vec::new(),
            extras,
            meta: BTreeMap::new(),
        }
    }

    /// Load a bundle from YAML text, with an optional metadata overlay
    pub fn from_yaml(bundle: &str, overlay: Option<&str>) -> Result<Self> {
        let doc: YamlValue = serde_yaml::from_str(bundle)?;
        let overlay_doc = overlay
            .map(|text| serde_yaml::from_str::<YamlValue>(text))
            .transpose()
            .map_err(|e| BundleError::MetadataParseFailed {
                reason: e.to_string(),
            })?;
        Bundle::from_value(doc, overlay_doc)
    }

    /// Load a bundle from a file, with an optional metadata overlay file
    ///
    /// A missing bundle file yields the default empty bundle; a missing
    /// overlay file is an error.
    pub fn from_files(path: &Path, overlay: Option<&Path>) -> Result<Self> {
        let overlay_text = overlay
            .map(|p| {
                std::fs::read_to_string(p).map_err(|e| BundleError::BundleReadFailed {
                    path: p.display().to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        if !path.exists() {
            debug!(path = %path.display(), "bundle file missing, starting empty");
            let mut bundle = Bundle::empty();
            if let Some(text) = overlay_text {
                bundle.meta = parse_overlay_text(&text)?;
            }
            return Ok(bundle);
        }

        let text = std::fs::read_to_string(path).map_err(|e| BundleError::BundleReadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Bundle::from_yaml(&text, overlay_text.as_deref())
    }

    /// Build a bundle from already-parsed YAML values
    pub fn from_value(doc: YamlValue, overlay: Option<YamlValue>) -> Result<Self> {
        let YamlValue::Mapping(mapping) = doc else {
            return Err(BundleError::InvalidBundle {
                reason: "top level is not a mapping".to_string(),
            });
        };

        let mut services = None;
        let mut machines = BTreeMap::new();
        let mut relations = Vec::new();
        let mut extras = BTreeMap::new();

        for (key, value) in mapping {
            let Some(key) = key_string(&key) else {
                return Err(BundleError::InvalidBundle {
                    reason: "non-scalar top-level key".to_string(),
                });
            };
            match key.to_lowercase().as_str() {
                "services" => services = Some(parse_services(value)?),
                "machines" => machines = parse_machines(value)?,
                "relations" => relations = parse_relations(value)?,
                other => {
                    extras.insert(other.to_string(), value);
                }
            }
        }

        let services = services.ok_or_else(|| BundleError::InvalidBundle {
            reason: "no 'services' key in bundle".to_string(),
        })?;

        let meta = match overlay {
            Some(doc) => parse_overlay(doc)?,
            None => BTreeMap::new(),
        };

        Ok(Bundle {
            services,
            machines,
            relations,
            extras,
            meta,
        })
    }

    /// Add a minimal service for a charm entity document, deriving and
    /// disambiguating the service name when none is given
    ///
    /// Returns the name the service was inserted under.
    pub fn add_service(
        &mut self,
        charm_name: &str,
        entity: &JsonValue,
        name: Option<&str>,
    ) -> Result<String> {
        let charm_id = entity
            .get("Id")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| BundleError::MissingField {
                field: "Id".to_string(),
            })?;

        let service_name = match name {
            Some(n) => n.to_string(),
            None => {
                let mut candidate = charm_name.to_string();
                let mut i = 1;
                while self.services.contains_key(&candidate) {
                    candidate = format!("{charm_name}-{i}");
                    i += 1;
                }
                candidate
            }
        };

        let entry = ServiceEntry {
            charm: charm_id.to_string(),
            num_units: Some(1),
            ..ServiceEntry::default()
        };
        self.services.insert(service_name.clone(), entry);
        Ok(service_name)
    }

    /// Remove a service and every relation mentioning it
    pub fn remove_service(&mut self, name: &str) {
        self.services.remove(name);
        self.relations.retain(|r| !r.mentions(name));
    }

    /// Append the relation `s1:r1` / `s2:r2`
    pub fn add_relation(&mut self, s1: &str, r1: &str, s2: &str, r2: &str) {
        self.relations
            .push(Relation(format!("{s1}:{r1}"), format!("{s2}:{r2}")));
    }

    /// Remove a matching relation; returns whether one was removed
    pub fn remove_relation(&mut self, s1: &str, r1: &str, s2: &str, r2: &str) -> bool {
        match self.find_relation(s1, r1, s2, r2) {
            Some(idx) => {
                self.relations.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Check whether a relation exists
    ///
    /// A stored relation that omits relation names matches any relation
    /// names for the same pair of services.
    pub fn relation_exists(&self, s1: &str, r1: &str, s2: &str, r2: &str) -> bool {
        self.find_relation(s1, r1, s2, r2).is_some()
    }

    fn find_relation(&self, s1: &str, r1: &str, s2: &str, r2: &str) -> Option<usize> {
        let a = format!("{s1}:{r1}");
        let b = format!("{s2}:{r2}");
        let candidates = [(a.as_str(), b.as_str()), (b.as_str(), a.as_str()), (s1, s2), (s2, s1)];
        self.relations
            .iter()
            .position(|rel| candidates.iter().any(|(x, y)| rel.is_pair(x, y)))
    }

    /// Empty the machines section and drop every service's placement targets
    pub fn clear_placement(&mut self) {
        self.machines.clear();
        for entry in self.services.values_mut() {
            entry.to = None;
        }
    }

    /// Derived service views, recomputed on every call
    pub fn services(&self) -> Vec<ServiceSpec> {
        let default_meta = ServiceMeta::default();
        self.services
            .iter()
            .map(|(name, entry)| {
                let meta = self.meta.get(name).unwrap_or(&default_meta);
                ServiceSpec::build(name, entry, meta, &self.relations)
            })
            .collect()
    }

    pub fn machines(&self) -> &BTreeMap<String, MachineSpec> {
        &self.machines
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    /// The bundle's series, falling back to the default
    pub fn series(&self) -> &str {
        self.extras
            .get("series")
            .and_then(YamlValue::as_str)
            .unwrap_or(DEFAULT_SERIES)
    }

    /// Placement targets keyed by service name, for services that have any
    pub fn assignments(&self) -> BTreeMap<String, Vec<String>> {
        self.services
            .iter()
            .filter_map(|(name, entry)| entry.to.clone().map(|to| (name.clone(), to)))
            .collect()
    }

    /// Top-level keys passed through opaquely (includes `series`)
    pub fn extra_items(&self) -> &BTreeMap<String, YamlValue> {
        &self.extras
    }

    /// Per-service metadata overlay entries
    pub fn service_meta(&self, name: &str) -> Option<&ServiceMeta> {
        self.meta.get(name)
    }

    /// Render the bundle back to a YAML value
    pub fn to_value(&self) -> YamlValue {
        let mut mapping = serde_yaml::Mapping::new();
        for (key, value) in &self.extras {
            mapping.insert(YamlValue::String(key.clone()), value.clone());
        }

        let mut services = serde_yaml::Mapping::new();
        for (name, entry) in &self.services {
            if let Ok(value) = serde_yaml::to_value(entry) {
                services.insert(YamlValue::String(name.clone()), value);
            }
        }
        mapping.insert(
            YamlValue::String("services".to_string()),
            YamlValue::Mapping(services),
        );

        if !self.machines.is_empty() {
            if let Ok(value) = serde_yaml::to_value(&self.machines) {
                mapping.insert(YamlValue::String("machines".to_string()), value);
            }
        }

        if !self.relations.is_empty() {
            if let Ok(value) = serde_yaml::to_value(&self.relations) {
                mapping.insert(YamlValue::String("relations".to_string()), value);
            }
        }

        YamlValue::Mapping(mapping)
    }
}

/// Render a map key to a string; YAML machine ids often parse as integers
fn key_string(key: &YamlValue) -> Option<String> {
    match key {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn lowercase_keys(mapping: serde_yaml::Mapping) -> serde_yaml::Mapping {
    mapping
        .into_iter()
        .map(|(k, v)| match k {
            YamlValue::String(s) => (YamlValue::String(s.to_lowercase()), v),
            other => (other, v),
        })
        .collect()
}

fn parse_services(value: YamlValue) -> Result<BTreeMap<String, ServiceEntry>> {
    let mut services = BTreeMap::new();
    let mapping = match value {
        YamlValue::Null => return Ok(services),
        YamlValue::Mapping(m) => m,
        _ => {
            return Err(BundleError::InvalidBundle {
                reason: "'services' is not a mapping".to_string(),
            });
        }
    };

    for (key, value) in mapping {
        let Some(name) = key_string(&key) else {
            return Err(BundleError::InvalidBundle {
                reason: "non-scalar service name".to_string(),
            });
        };
        let entry = match value {
            YamlValue::Null => ServiceEntry::default(),
            YamlValue::Mapping(m) => {
                serde_yaml::from_value(YamlValue::Mapping(lowercase_keys(m))).map_err(|e| {
                    BundleError::BundleParseFailed {
                        reason: format!("service '{name}': {e}"),
                    }
                })?
            }
            _ => {
                return Err(BundleError::InvalidBundle {
                    reason: format!("service '{name}' is not a mapping"),
                });
            }
        };
        services.insert(name.to_lowercase(), entry);
    }
    Ok(services)
}

fn parse_machines(value: YamlValue) -> Result<BTreeMap<String, MachineSpec>> {
    let mut machines = BTreeMap::new();
    let mapping = match value {
        YamlValue::Null => return Ok(machines),
        YamlValue::Mapping(m) => m,
        _ => {
            return Err(BundleError::InvalidBundle {
                reason: "'machines' is not a mapping".to_string(),
            });
        }
    };

    for (key, value) in mapping {
        let Some(id) = key_string(&key) else {
            return Err(BundleError::InvalidBundle {
                reason: "non-scalar machine id".to_string(),
            });
        };
        let spec = match value {
            YamlValue::Null => MachineSpec::new(),
            YamlValue::Mapping(m) => lowercase_keys(m)
                .into_iter()
                .filter_map(|(k, v)| key_string(&k).map(|k| (k, v)))
                .collect(),
            _ => {
                return Err(BundleError::InvalidBundle {
                    reason: format!("machine '{id}' is not a mapping"),
                });
            }
        };
        machines.insert(id.to_lowercase(), spec);
    }
    Ok(machines)
}

fn parse_relations(value: YamlValue) -> Result<Vec<Relation>> {
    let items = match value {
        YamlValue::Null => return Ok(Vec::new()),
        YamlValue::Sequence(seq) => seq,
        _ => {
            return Err(BundleError::InvalidBundle {
                reason: "'relations' is not a sequence".to_string(),
            });
        }
    };

    items
        .into_iter()
        .map(|item| {
            let YamlValue::Sequence(pair) = item else {
                return Err(BundleError::InvalidBundle {
                    reason: "relation is not a two-element pair".to_string(),
                });
            };
            match pair.as_slice() {
                [YamlValue::String(a), YamlValue::String(b)] => {
                    Ok(Relation(a.clone(), b.clone()))
                }
                _ => Err(BundleError::InvalidBundle {
                    reason: "relation endpoints must be two strings".to_string(),
                }),
            }
        })
        .collect()
}

fn parse_overlay(doc: YamlValue) -> Result<BTreeMap<String, ServiceMeta>> {
    let services = match doc {
        YamlValue::Null => return Ok(BTreeMap::new()),
        YamlValue::Mapping(mut m) => {
            match m.remove(&YamlValue::String("services".to_string())) {
                Some(v) => v,
                None => return Ok(BTreeMap::new()),
            }
        }
        _ => {
            return Err(BundleError::MetadataParseFailed {
                reason: "overlay is not a mapping".to_string(),
            });
        }
    };

    let YamlValue::Mapping(mapping) = services else {
        return Err(BundleError::MetadataParseFailed {
            reason: "overlay 'services' is not a mapping".to_string(),
        });
    };

    let mut meta = BTreeMap::new();
    for (key, value) in mapping {
        let Some(name) = key_string(&key) else {
            return Err(BundleError::MetadataParseFailed {
                reason: "non-scalar service name in overlay".to_string(),
            });
        };
        let entry: ServiceMeta =
            serde_yaml::from_value(value).map_err(|e| BundleError::MetadataParseFailed {
                reason: format!("service '{name}': {e}"),
            })?;
        meta.insert(name.to_lowercase(), entry);
    }
    Ok(meta)
}

fn parse_overlay_text(text: &str) -> Result<BTreeMap<String, ServiceMeta>> {
    let doc: YamlValue =
        serde_yaml::from_str(text).map_err(|e| BundleError::MetadataParseFailed {
            reason: e.to_string(),
        })?;
    parse_overlay(doc)
}
