//! Tests for identity bindings: triple uniqueness, revocation, reload.

mod common;

use std::sync::Arc;

use mu::identity::{BindRequest, IdentityRegistry};

fn request(channel: &str, actor: &str) -> BindRequest {
    BindRequest {
        operator_id: "op-1".to_owned(),
        channel: channel.to_owned(),
        channel_tenant_id: "tenant-1".to_owned(),
        channel_actor_id: actor.to_owned(),
        scopes: vec!["notify".to_owned()],
    }
}

#[tokio::test(start_paused = true)]
async fn duplicate_active_triple_is_a_conflict() {
    let world = common::build_world();
    let binding = world.identities.bind(request("slack", "U1")).expect("bind");
    assert!(binding.binding_id.starts_with("bd-"));
    assert!(binding.active);

    let err = world
        .identities
        .bind(request("slack", "U1"))
        .expect_err("duplicate triple");
    assert_eq!(err.reason_code(), "conflict");
    assert_eq!(err.exit_code(), 4);

    // A different actor on the same channel is fine.
    world.identities.bind(request("slack", "U2")).expect("bind");
    assert_eq!(world.identities.list_active(Some("slack")).expect("list").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn revoked_binding_frees_the_triple() {
    let world = common::build_world();
    let binding = world.identities.bind(request("slack", "U1")).expect("bind");

    let revoked = world.identities.revoke(&binding.binding_id).expect("revoke");
    assert!(!revoked.active);
    assert!(revoked.revoked_at_ms.is_some());
    assert!(world.identities.list_active(None).expect("list").is_empty());

    // Re-binding the triple succeeds; the old binding id stays revoked.
    let fresh = world.identities.bind(request("slack", "U1")).expect("rebind");
    assert_ne!(fresh.binding_id, binding.binding_id);
}

#[tokio::test(start_paused = true)]
async fn bindings_reload_from_disk() {
    let world = common::build_world();
    world.identities.bind(request("slack", "U1")).expect("bind");

    let clock_dyn: Arc<dyn mu::clock::Clock> = world.clock.clone();
    let reloaded = IdentityRegistry::new(&world.paths.identities_jsonl, clock_dyn);
    let bindings = reloaded.list().expect("list");
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].channel_actor_id, "U1");
}
