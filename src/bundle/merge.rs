//! Structural bundle merging
//!
//! Merging folds a second topology into the first, renaming colliding
//! service names and machine ids and rewriting every relation endpoint and
//! placement target through the same rename maps in a single pass. Computing
//! both maps up front is what keeps the three structures referentially
//! consistent: a rename applied to `services` but not to `relations` or `to`
//! lists would leave dangling references.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::bundle::{Bundle, MachineSpec, Relation, ServiceSpec};
use crate::error::{BundleError, Result};

/// What a merge added to the receiving bundle
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Machines inserted from the other bundle, under their final ids
    pub machines: BTreeMap<String, MachineSpec>,
    /// Views of the services inserted from the other bundle, post-merge
    pub services: Vec<ServiceSpec>,
    /// Rewritten placement targets, keyed by final service name
    pub assignments: BTreeMap<String, Vec<String>>,
}

/// Rename-map lookup: a key with no entry renames to itself
fn renamed<'a>(renames: &'a HashMap<String, String>, key: &'a str) -> &'a str {
    renames.get(key).map_or(key, String::as_str)
}

/// Rewrite a relation endpoint's service segment, preserving any
/// `:relation-name` suffix
fn rename_endpoint(endpoint: &str, renames: &HashMap<String, String>) -> String {
    match endpoint.split_once(':') {
        Some((service, rel)) => format!("{}:{rel}", renamed(renames, service)),
        None => renamed(renames, endpoint).to_string(),
    }
}

/// Rewrite a placement target's machine segment, preserving any container
/// qualifier (`kvm:0`, `lxd:2`, ...)
fn rename_target(target: &str, renames: &HashMap<String, String>) -> String {
    match target.split_once(':') {
        Some((qualifier, machine)) => format!("{qualifier}:{}", renamed(renames, machine)),
        None => renamed(renames, target).to_string(),
    }
}

impl Bundle {
    /// Merge another bundle into this one, renaming any colliding service
    /// names or machine ids
    ///
    /// Fails without touching `self` if the two bundles disagree on a shared
    /// top-level key other than services/machines/relations.
    pub fn merge(&mut self, other: &Bundle) -> Result<MergeOutcome> {
        // conflicts that can't be resolved by renaming
        for (key, ours) in &self.extras {
            let theirs = other.extras.get(key);
            if theirs != Some(ours) {
                return Err(BundleError::MergeConflict {
                    key: key.clone(),
                    ours: yaml_display(ours),
                    theirs: theirs.map_or_else(|| "<missing>".to_string(), yaml_display),
                });
            }
        }

        let mut outcome = MergeOutcome::default();

        let mut service_renames = HashMap::new();
        for name in other.services.keys() {
            if self.services.contains_key(name) {
                service_renames.insert(name.clone(), format!("{name}-1"));
            }
        }

        // generate machine renames and merge machines
        let mut machine_renames = HashMap::new();
        let machine_count = self.machines.len();
        for (id, spec) in &other.machines {
            if self.machines.contains_key(id) {
                let new_id = match id.parse::<u64>() {
                    Ok(n) => (n + machine_count as u64).to_string(),
                    Err(_) => format!("{id}-{machine_count}"),
                };
                machine_renames.insert(id.clone(), new_id);
            }
            let final_id = renamed(&machine_renames, id).to_string();
            self.machines.insert(final_id.clone(), spec.clone());
            outcome.machines.insert(final_id, spec.clone());
        }

        if !service_renames.is_empty() || !machine_renames.is_empty() {
            debug!(
                services = service_renames.len(),
                machines = machine_renames.len(),
                "resolved merge collisions by renaming"
            );
        }

        // apply service renames to the other bundle's relations
        for relation in &other.relations {
            let rewritten = Relation(
                rename_endpoint(&relation.0, &service_renames),
                rename_endpoint(&relation.1, &service_renames),
            );
            let reversed = Relation(rewritten.1.clone(), rewritten.0.clone());
            if self.relations.contains(&rewritten) || self.relations.contains(&reversed) {
                continue;
            }
            self.relations.push(rewritten);
        }

        // apply machine renames to the other bundle's services
        let mut inserted_names = Vec::new();
        for (name, entry) in &other.services {
            let mut new_entry = entry.clone();
            if let Some(targets) = &entry.to {
                let rewritten: Vec<String> = targets
                    .iter()
                    .map(|t| rename_target(t, &machine_renames))
                    .collect();
                new_entry.to = Some(rewritten.clone());
                outcome
                    .assignments
                    .insert(renamed(&service_renames, name).to_string(), rewritten);
            }
            let final_name = renamed(&service_renames, name).to_string();
            self.services.insert(final_name.clone(), new_entry);
            inserted_names.push(final_name);
        }

        outcome.services = self
            .services()
            .into_iter()
            .filter(|s| inserted_names.contains(&s.service_name))
            .collect();

        Ok(outcome)
    }
}

fn yaml_display(value: &serde_yaml::Value) -> String {
    serde_yaml::to_string(value).map_or_else(|_| format!("{value:?}"), |s| s.trim().to_string())
}
