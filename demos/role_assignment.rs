//! # Role Assignment Example
//!
//! Walks through who may grant which role, prints the evaluation trace of
//! each attempt and shows how cached verdicts behave across a role change.
//!
//! To run this example:
//! ```
//! cargo run --example role_assignment
//! ```

use greenroom::*;

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("=== Role Assignment Example ===\n");

    let engine = PolicyEngine::new(PermissionCatalog::standard());
    let guard = RoleAssignmentGuard::new(&engine);

    let root = DecisionContext::new("root", Role::SuperAdmin);
    let org_admin = DecisionContext::new("admin-1", Role::OrgAdmin).in_organization("org-1");
    let client = DecisionContext::new("client-1", Role::Client).in_organization("org-1");

    let attempts = [
        ("Org admin", &org_admin, Role::Creator),
        ("Org admin", &org_admin, Role::SuperAdmin),
        ("Super admin", &root, Role::SuperAdmin),
        ("Client", &client, Role::Creator),
    ];

    for (label, assigner, new_role) in attempts {
        let evaluation = guard.evaluate(assigner, "u7", new_role);
        println!("{label} assigning {new_role} to u7:");
        println!("{}\n", evaluation.display_trace());
    }

    println!("=== Cache entries after a role change ===\n");

    let before = DecisionContext::new("u7", Role::Viewer);
    let allowed = engine.check_permission(&before, Resource::Project, Action::Create);
    println!("u7 as {} may create projects: {allowed}", Role::Viewer);

    // The role is part of the cache key, so the new role gets its own verdict.
    let after = DecisionContext::new("u7", Role::Creator);
    let allowed = engine.check_permission(&after, Resource::Project, Action::Create);
    println!("u7 as {} may create projects: {allowed}", Role::Creator);

    // Verdicts computed under the old role are dead weight until they expire.
    let removed = engine.invalidate_subject_cache("u7");
    println!("Dropped {removed} cached verdicts for u7");
}
