use super::*;
use crate::workload::parse_workload;
use serde_json::json;

fn bound_state(resources: &str) -> (State, Bindings) {
    let text = format!(
        "apiVersion: score.dev/v1b1\nmetadata:\n  name: web\ncontainers:\n  main:\n    image: nginx\nresources:\n{resources}"
    );
    let mut state = State::new("demo-");
    state
        .with_workload(parse_workload(&text).expect("parse workload"), None)
        .unwrap();
    let bindings = state.resource_bindings().unwrap();
    (state, bindings)
}

fn uid(name: &str, res_type: &str) -> ResourceUid {
    ResourceUid::new("web", name, res_type, None, None)
}

#[test]
fn dependencies_come_first() {
    let (state, bindings) = bound_state(
        "  a:\n    type: app\n    params:\n      url: \"${resources.b.x}\"\n  b:\n    type: db\n",
    );
    let order = provisioning_order(&state, &bindings).unwrap();
    assert_eq!(order, vec![uid("b", "db"), uid("a", "app")]);
}

#[test]
fn independent_resources_are_ordered_by_uid() {
    let (state, bindings) = bound_state(
        "  z:\n    type: dns\n  m:\n    type: dns\n  a:\n    type: dns\n    params:\n      target: \"${resources.z}\"\n",
    );
    let order = provisioning_order(&state, &bindings).unwrap();
    assert_eq!(order, vec![uid("m", "dns"), uid("z", "dns"), uid("a", "dns")]);
}

#[test]
fn cycle_names_every_member_and_nothing_else() {
    let (state, bindings) = bound_state(concat!(
        "  a:\n    type: app\n    params:\n      x: \"${resources.b.x}\"\n",
        "  b:\n    type: app\n    params:\n      x: \"${resources.a.x}\"\n",
        "  c:\n    type: app\n    params:\n      nested:\n        - \"${resources.a.y}\"\n",
        "  d:\n    type: app\n",
    ));
    let err = provisioning_order(&state, &bindings).unwrap_err();
    assert_eq!(err.members, vec![uid("a", "app"), uid("b", "app")]);
    let text = err.to_string();
    assert!(text.contains("app.default#web.a") && text.contains("app.default#web.b"), "{text}");
}

#[test]
fn resources_between_two_cycles_are_not_members() {
    // x depends on the a/b cycle and c depends on x, while c and d form a
    // second cycle; x itself sits on neither.
    let (state, bindings) = bound_state(concat!(
        "  a:\n    type: app\n    params:\n      x: \"${resources.b.x}\"\n",
        "  b:\n    type: app\n    params:\n      x: \"${resources.a.x}\"\n",
        "  x:\n    type: app\n    params:\n      x: \"${resources.a.x}\"\n",
        "  c:\n    type: app\n    params:\n      x: \"${resources.x.x} ${resources.d.x}\"\n",
        "  d:\n    type: app\n    params:\n      x: \"${resources.c.x}\"\n",
    ));
    let err = provisioning_order(&state, &bindings).unwrap_err();
    assert_eq!(
        err.members,
        vec![uid("a", "app"), uid("b", "app"), uid("c", "app"), uid("d", "app")]
    );
}

#[test]
fn self_reference_is_a_cycle() {
    let (state, bindings) = bound_state(
        "  a:\n    type: app\n    params:\n      x: \"${resources.a.x}\"\n  b:\n    type: app\n",
    );
    let err = provisioning_order(&state, &bindings).unwrap_err();
    assert_eq!(err.members, vec![uid("a", "app")]);
}

#[test]
fn ties_break_on_type_before_name() {
    let (state, bindings) = bound_state("  a:\n    type: zz\n  b:\n    type: aa\n");
    let order = provisioning_order(&state, &bindings).unwrap();
    assert_eq!(order, vec![uid("b", "aa"), uid("a", "zz")]);
}

#[test]
fn references_to_undeclared_names_add_no_edges() {
    let (state, bindings) = bound_state(
        "  a:\n    type: app\n    params:\n      x: \"${resources.ghost.x} ${metadata.name}\"\n",
    );
    assert!(dependencies_of(&state, &bindings[&uid("a", "app")]).is_empty());
    assert_eq!(provisioning_order(&state, &bindings).unwrap(), vec![uid("a", "app")]);
}

#[test]
fn outputs_prefer_secrets_and_walk_nested_paths() {
    let (mut state, _) = bound_state("  db:\n    type: postgres\n");
    state.prime_resources().unwrap();
    let entry = state.resources.get_mut(&uid("db", "postgres")).unwrap();
    entry.outputs = match json!({"password": "plain", "hosts": [{"name": "h0"}], "default": "pg"}) {
        Value::Object(map) => map,
        _ => unreachable!(),
    };
    entry.secrets = match json!({"password": "s3cret"}) {
        Value::Object(map) => map,
        _ => unreachable!(),
    };

    let outputs = outputs_for(&state, "web").unwrap();
    let db = outputs["db"];
    let password = db.lookup(&["password"]).unwrap();
    assert_eq!(password.value, json!("s3cret"));
    assert_eq!(password.channel, Channel::Secrets);

    let host = db.lookup(&["hosts", "0", "name"]).unwrap();
    assert_eq!(host.value, json!("h0"));
    assert_eq!(host.channel, Channel::Values);

    assert_eq!(db.lookup(&[]).unwrap().value, json!("pg"));
    assert!(db.lookup(&["hosts", "7"]).is_err());
    assert!(outputs_for(&state, "missing").is_err());
}
