//! End-to-end bundle merge scenarios through the public API

use bundlesmith::bundle::Relation;
use bundlesmith::{Bundle, BundleError};

fn bundle(yaml: &str) -> Bundle {
    Bundle::from_yaml(yaml, None).expect("test bundle should parse")
}

fn service_names(bundle: &Bundle) -> Vec<String> {
    bundle
        .services()
        .into_iter()
        .map(|s| s.service_name)
        .collect()
}

#[test]
fn merging_disjoint_bundles_keeps_all_names() {
    let mut a = bundle(
        r#"
services:
  wordpress:
    charm: "cs:wordpress"
    num_units: 1
machines: {}
relations: []
"#,
    );
    let b = bundle(
        r#"
services:
  mysql:
    charm: "cs:mysql"
    num_units: 1
relations: []
"#,
    );

    let outcome = a.merge(&b).expect("disjoint bundles should merge");

    let names = service_names(&a);
    assert!(names.contains(&"wordpress".to_string()));
    assert!(names.contains(&"mysql".to_string()));
    assert_eq!(outcome.services.len(), 1);
    assert_eq!(outcome.services[0].service_name, "mysql");
    assert!(outcome.machines.is_empty());
}

#[test]
fn colliding_services_and_machines_are_renamed_consistently() {
    let mut a = bundle(
        r#"
series: trusty
services:
  mysql:
    charm: "cs:trusty/mysql-26"
    num_units: 1
    to: ["0"]
machines:
  0: {}
  1: {}
"#,
    );
    let b = bundle(
        r#"
series: trusty
services:
  mysql:
    charm: "cs:trusty/mysql-26"
    num_units: 1
    to: ["kvm:0"]
  wordpress:
    charm: "cs:trusty/wordpress-5"
    num_units: 1
machines:
  0: {}
relations:
  - ["mysql:db", "wordpress:db"]
"#,
    );

    let outcome = a.merge(&b).expect("renamable collisions should merge");

    // second mysql got the -1 suffix, its relation endpoint followed
    let names = service_names(&a);
    assert!(names.contains(&"mysql".to_string()));
    assert!(names.contains(&"mysql-1".to_string()));
    assert_eq!(
        a.relations(),
        &[Relation::new("mysql-1:db", "wordpress:db")]
    );

    // machine 0 shifted past the two existing machines, placement followed
    assert!(a.machines().contains_key("2"));
    assert_eq!(outcome.assignments["mysql-1"], vec!["kvm:2".to_string()]);
    assert_eq!(a.assignments()["mysql-1"], vec!["kvm:2".to_string()]);
    assert_eq!(a.assignments()["mysql"], vec!["0".to_string()]);
}

#[test]
fn conflicting_series_fails_before_any_mutation() {
    let mut a = bundle("series: trusty\nservices: {}\nmachines:\n  0: {}\n");
    let b = bundle(
        r#"
series: xenial
services:
  mysql:
    charm: "cs:mysql"
    num_units: 1
"#,
    );

    let err = a.merge(&b).expect_err("series conflict should fail");
    match err {
        BundleError::MergeConflict { key, .. } => assert_eq!(key, "series"),
        other => panic!("expected a merge conflict, got {other:?}"),
    }
    assert!(service_names(&a).is_empty());
    assert_eq!(a.machines().len(), 1);
}

#[test]
fn merge_then_query_relations() {
    let mut a = bundle(
        r#"
services:
  wordpress:
    charm: "cs:wordpress"
    num_units: 1
relations: []
"#,
    );
    let b = bundle(
        r#"
services:
  mysql:
    charm: "cs:mysql"
    num_units: 1
relations:
  - ["mysql", "wordpress"]
"#,
    );

    a.merge(&b).expect("bundles should merge");
    // a bare stored relation matches any relation names for the same pair
    assert!(a.relation_exists("mysql", "db", "wordpress", "db"));
    assert!(!a.relation_exists("mysql", "db", "memcached", "cache"));
}

#[test]
fn merged_services_report_their_relations() {
    let mut a = bundle(
        r#"
services:
  wordpress:
    charm: "cs:wordpress"
    num_units: 1
relations: []
"#,
    );
    let b = bundle(
        r#"
services:
  mysql:
    charm: "cs:mysql"
    num_units: 1
relations:
  - ["mysql:db", "wordpress:db"]
"#,
    );

    let outcome = a.merge(&b).expect("bundles should merge");
    let mysql = outcome
        .services
        .iter()
        .find(|s| s.service_name == "mysql")
        .expect("mysql should be in the merge outcome");
    assert_eq!(
        mysql.relations,
        vec![Relation::new("mysql:db", "wordpress:db")]
    );
}
