//! An authorization engine for a creator marketplace: role-based access
//! control with per-action, per-resource, conditionally scoped permissions
//! and a short-lived decision cache.
//!
//! # Overview
//!
//! A [`PermissionCatalog`] maps every [`Role`] to an ordered list of
//! [`Permission`]s. A permission names a resource and an action (either of
//! which may be the `*` wildcard) plus optional [`Condition`]s that must all
//! hold for the permission to grant access.
//!
//! The [`PolicyEngine`] answers "may this subject perform this action on
//! this resource?" for a [`DecisionContext`] supplied fresh by the caller on
//! every check. Verdicts are memoized in a [`DecisionCache`] for five minutes
//! by default. Everything fails closed: unknown roles, malformed contexts,
//! missing resource data and faults inside a condition evaluator all deny.
//!
//! ```rust
//! use greenroom::*;
//!
//! let engine = PolicyEngine::new(PermissionCatalog::standard());
//!
//! // A creator may edit a booking they are assigned to while it is a draft.
//! let creator = DecisionContext::new("u1", Role::Creator)
//!     .for_instance("booking-7")
//!     .with_resource_data(ResourceData::new().assigned_to("u1").status("DRAFT"));
//! assert!(engine.check_permission(&creator, Resource::Booking, Action::Update));
//!
//! // ...but never delete it.
//! assert!(!engine.check_permission(&creator, Resource::Booking, Action::Delete));
//!
//! // Org admins manage users, yet cannot hand out the super admin role.
//! let admin = DecisionContext::new("admin-1", Role::OrgAdmin);
//! assert!(engine.check_permission(&admin, Resource::User, Action::Manage));
//! assert!(!engine.assign_role(&admin, "u1", Role::SuperAdmin));
//! ```
//!
//! ## Evaluation Tracing
//!
//! [`PolicyEngine::evaluate`] returns an [`AccessEvaluation`] carrying the
//! matched rule and a trace of every condition that was checked, see
//! [`EvalTrace`].
//!
//! ## Route protection
//!
//! A [`RouteGuard`] binds a resource and action to the engine once, at route
//! registration time, and returns a typed [`AccessDenied`] instead of
//! throwing. [`RouteGuard::authorize_instance`] loads instance data through a
//! [`ResourceLoader`] before the check.
//!
//! ## Data scopes
//!
//! `scope=` conditions never narrow the boolean verdict. Use
//! [`PolicyEngine::data_scope`] to learn which slice of the data a granted
//! request should be filtered down to.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

const SECURITY_RULE_CATEGORY: &str = "Access Control";
const ENGINE_RULE: &str = "PolicyEngine";
const CACHE_RULE: &str = "DecisionCache";
const GUARD_RULE: &str = "RoleAssignmentGuard";
const ESCALATION_RULE: &str = "PrivilegeEscalationGuard";

const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_MAX_CACHE_ENTRIES: usize = 10_000;
const DEFAULT_EVICTION_BATCH_SIZE: usize = 100;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error returned when a role, resource or action name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The name matches no [`Role`].
    #[error("unknown role `{0}`")]
    UnknownRole(String),
    /// The name matches no [`Resource`].
    #[error("unknown resource `{0}`")]
    UnknownResource(String),
    /// The name matches no [`Action`].
    #[error("unknown action `{0}`")]
    UnknownAction(String),
}

/// A required field of a decision request is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The subject id is empty or blank.
    #[error("decision context has no subject id")]
    MissingSubject,
    /// No role was supplied, or the claimed role was not recognised.
    #[error("decision context has no role")]
    MissingRole,
    /// The role assignment names no target subject.
    #[error("role assignment has no target subject")]
    MissingTarget,
}

/// Why a decision came out as a denial.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DenyReason {
    /// The context failed [`DecisionContext::validate`].
    #[error("malformed decision context: {0}")]
    MalformedContext(#[from] ContextError),
    /// None of the role's permissions covers the pair.
    #[error("no permission of {role} covers {resource}:{action}")]
    NoMatchingPermission {
        role: Role,
        resource: Resource,
        action: Action,
    },
    /// A matching permission was found but this condition is false.
    #[error("condition `{0}` does not hold")]
    ConditionFailed(Condition),
    /// The condition evaluator panicked.
    #[error("condition `{0}` could not be evaluated")]
    EvaluationFault(Condition),
    /// Only a holder of this role may assign it.
    #[error("only {0} may assign {0}")]
    PrivilegeEscalation(Role),
    /// Served from the decision cache; the original reason is not kept.
    #[error("a previous evaluation denied this request")]
    Cached,
}

/// Structured denial returned by a [`RouteGuard`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("access to {resource}:{action} denied: {reason}")]
pub struct AccessDenied {
    /// The resource the route is bound to.
    pub resource: Resource,
    /// The action the route is bound to.
    pub action: Action,
    /// Why the request was denied.
    pub reason: DenyReason,
}

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// An identity class carrying a fixed bundle of permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Unrestricted access to everything.
    SuperAdmin,
    /// Administers one organization.
    OrgAdmin,
    /// Runs a label and its roster.
    LabelManager,
    /// Manages the artists assigned to them.
    ArtistManager,
    /// Runs a studio's bookings and projects.
    StudioManager,
    /// Manages invoices and reads financial records.
    Accountant,
    /// A performer or producer offering work.
    Creator,
    /// A buyer booking creators.
    Client,
    /// Read-only visitor.
    Viewer,
}

impl Role {
    /// Every role, most privileged first.
    pub const ALL: [Role; 9] = [
        Role::SuperAdmin,
        Role::OrgAdmin,
        Role::LabelManager,
        Role::ArtistManager,
        Role::StudioManager,
        Role::Accountant,
        Role::Creator,
        Role::Client,
        Role::Viewer,
    ];

    /// The wire spelling, e.g. `ORG_ADMIN`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SuperAdmin => "SUPER_ADMIN",
            Role::OrgAdmin => "ORG_ADMIN",
            Role::LabelManager => "LABEL_MANAGER",
            Role::ArtistManager => "ARTIST_MANAGER",
            Role::StudioManager => "STUDIO_MANAGER",
            Role::Accountant => "ACCOUNTANT",
            Role::Creator => "CREATOR",
            Role::Client => "CLIENT",
            Role::Viewer => "VIEWER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Role::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ParseError::UnknownRole(s.to_string()))
    }
}

/// An object type that access is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    /// Tenant organizations.
    Organization,
    /// User accounts and their roles.
    User,
    /// Artist profiles.
    Artist,
    /// Bookings between clients and creators.
    Booking,
    /// Collaborative projects.
    Project,
    /// Contracts attached to bookings or projects.
    Contract,
    /// Invoices.
    Invoice,
    /// Reporting dashboards.
    Analytics,
    /// Billing plans.
    Subscription,
    /// Organization settings.
    Settings,
}

impl Resource {
    /// Every resource, in declaration order.
    pub const ALL: [Resource; 10] = [
        Resource::Organization,
        Resource::User,
        Resource::Artist,
        Resource::Booking,
        Resource::Project,
        Resource::Contract,
        Resource::Invoice,
        Resource::Analytics,
        Resource::Subscription,
        Resource::Settings,
    ];

    /// The lowercase wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Organization => "organization",
            Resource::User => "user",
            Resource::Artist => "artist",
            Resource::Booking => "booking",
            Resource::Project => "project",
            Resource::Contract => "contract",
            Resource::Invoice => "invoice",
            Resource::Analytics => "analytics",
            Resource::Subscription => "subscription",
            Resource::Settings => "settings",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resource {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Resource::ALL
            .into_iter()
            .find(|resource| resource.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ParseError::UnknownResource(s.to_string()))
    }
}

/// An operation verb. [`Action::Manage`] in a permission satisfies every
/// specific action on the same resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Create a new instance.
    Create,
    /// Read an instance or list them.
    Read,
    /// Modify an instance.
    Update,
    /// Remove an instance.
    Delete,
    /// Implies every other action on the resource.
    Manage,
    /// Sign off on an instance.
    Approve,
    /// Attach subjects to an instance.
    Assign,
    /// Download data in bulk formats.
    Export,
    /// Act on many instances at once.
    BulkOperation,
}

impl Action {
    /// Every action, in declaration order.
    pub const ALL: [Action; 9] = [
        Action::Create,
        Action::Read,
        Action::Update,
        Action::Delete,
        Action::Manage,
        Action::Approve,
        Action::Assign,
        Action::Export,
        Action::BulkOperation,
    ];

    /// The lowercase wire spelling; `BulkOperation` is `bulk_operation`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Manage => "manage",
            Action::Approve => "approve",
            Action::Assign => "assign",
            Action::Export => "export",
            Action::BulkOperation => "bulk_operation",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Action::ALL
            .into_iter()
            .find(|action| action.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ParseError::UnknownAction(s.to_string()))
    }
}

/// Either the `*` wildcard or one concrete value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pattern<T> {
    /// Matches every value.
    Any,
    /// Matches exactly this value.
    Only(T),
}

impl<T: PartialEq> Pattern<T> {
    /// Whether `value` is covered by this pattern.
    pub fn matches(&self, value: &T) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Only(expected) => expected == value,
        }
    }

    /// Whether this is the `*` wildcard.
    pub fn is_any(&self) -> bool {
        matches!(self, Pattern::Any)
    }
}

impl<T> From<T> for Pattern<T> {
    fn from(value: T) -> Self {
        Pattern::Only(value)
    }
}

impl<T: fmt::Display> fmt::Display for Pattern<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Any => f.write_str("*"),
            Pattern::Only(value) => value.fmt(f),
        }
    }
}

/// The slice of data a `scope=` condition narrows a grant to.
///
/// Scopes do not take part in the boolean verdict; hosts filter their result
/// sets with the value returned by [`PolicyEngine::data_scope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataScope {
    /// No narrowing.
    All,
    /// Money-related figures only.
    Financial,
    /// Headline figures only.
    Basic,
    /// The subject's own records. Spelled `self` on the wire.
    #[serde(rename = "self")]
    Own,
    /// Records assigned to the subject.
    Assigned,
    /// Records of the subject's studio.
    Studio,
}

impl DataScope {
    /// The spelling used in `scope=` conditions.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataScope::All => "all",
            DataScope::Financial => "financial",
            DataScope::Basic => "basic",
            DataScope::Own => "self",
            DataScope::Assigned => "assigned",
            DataScope::Studio => "studio",
        }
    }
}

impl fmt::Display for DataScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A predicate narrowing a permission to particular resource instances or
/// request contexts. All conditions of one permission are ANDed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// The instance being checked is the subject itself.
    IsSelf,
    /// The subject is the instance's assignee, artist or creator.
    Assigned,
    /// The subject created the instance.
    Created,
    /// The subject owns the instance.
    Owner,
    /// The subject is listed among the instance's members.
    Member,
    /// The caller's role is one of these.
    RoleIn(Vec<Role>),
    /// The instance's status is one of these (ASCII case-insensitive).
    StatusIn(Vec<String>),
    /// Data-filtering hint; always holds.
    Scope(DataScope),
}

impl Condition {
    /// Shorthand for [`Condition::RoleIn`].
    pub fn role_in(roles: impl IntoIterator<Item = Role>) -> Self {
        Condition::RoleIn(roles.into_iter().collect())
    }

    /// Shorthand for [`Condition::StatusIn`].
    pub fn status_in<I, S>(statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Condition::StatusIn(statuses.into_iter().map(Into::into).collect())
    }

    /// The condition's name as it appears in traces.
    pub fn name(&self) -> &'static str {
        match self {
            Condition::IsSelf => "self",
            Condition::Assigned => "assigned",
            Condition::Created => "created",
            Condition::Owner => "owner",
            Condition::Member => "member",
            Condition::RoleIn(_) => "role",
            Condition::StatusIn(_) => "status",
            Condition::Scope(_) => "scope",
        }
    }

    /// Whether the condition reads [`DecisionContext::resource_data`].
    pub fn needs_resource_data(&self) -> bool {
        matches!(
            self,
            Condition::Assigned
                | Condition::Created
                | Condition::Owner
                | Condition::Member
                | Condition::StatusIn(_)
        )
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::RoleIn(roles) => {
                let names: Vec<&str> = roles.iter().map(Role::as_str).collect();
                write!(f, "role in [{}]", names.join(", "))
            }
            Condition::StatusIn(statuses) => write!(f, "status in [{}]", statuses.join(", ")),
            Condition::Scope(scope) => write!(f, "scope={}", scope),
            other => f.write_str(other.name()),
        }
    }
}

/// A (resource, action, conditions) grant held by a role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    resource: Pattern<Resource>,
    action: Pattern<Action>,
    conditions: Vec<Condition>,
}

impl Permission {
    /// An unconditional permission for `resource` and `action`.
    pub fn new(resource: impl Into<Pattern<Resource>>, action: impl Into<Pattern<Action>>) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
            conditions: Vec::new(),
        }
    }

    /// The `*:*` permission. Short-circuits every check to allow.
    pub fn everything() -> Self {
        Self::new(Pattern::<Resource>::Any, Pattern::<Action>::Any)
    }

    /// Adds a condition that must hold for this permission to grant access.
    pub fn when(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// The resource pattern.
    pub fn resource(&self) -> Pattern<Resource> {
        self.resource
    }

    /// The action pattern.
    pub fn action(&self) -> Pattern<Action> {
        self.action
    }

    /// Conditions in the order they are checked.
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Whether this is the `*:*` permission.
    pub fn is_wildcard(&self) -> bool {
        self.resource.is_any() && self.action.is_any()
    }

    /// Whether this permission covers `resource` and `action`, ignoring
    /// conditions.
    pub fn matches(&self, resource: Resource, action: Action) -> bool {
        let action_matches = match self.action {
            Pattern::Any => true,
            Pattern::Only(granted) => granted == action || granted == Action::Manage,
        };
        self.resource.matches(&resource) && action_matches
    }

    /// The first `scope=` condition, if any.
    pub fn scope(&self) -> Option<DataScope> {
        self.conditions.iter().find_map(|condition| match condition {
            Condition::Scope(scope) => Some(*scope),
            _ => None,
        })
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.action)
    }
}

/// One member entry of [`ResourceData::members`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    /// Subject id of the member.
    pub user_id: String,
}

/// The instance fields conditions are evaluated against. Supplied by the
/// host's data-access layer; field names follow its camelCase JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceData {
    /// Subject the instance is assigned to.
    pub assigned_to: Option<String>,
    /// Subject of the artist the instance belongs to.
    pub artist_id: Option<String>,
    /// Subject that created the instance.
    pub created_by: Option<String>,
    /// Subject that owns the instance.
    pub owner_id: Option<String>,
    /// Subjects listed as members.
    pub members: Vec<Member>,
    /// Workflow status, e.g. `DRAFT`.
    pub status: Option<String>,
}

impl ResourceData {
    /// Empty instance data.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the assignee.
    pub fn assigned_to(mut self, subject_id: impl Into<String>) -> Self {
        self.assigned_to = Some(subject_id.into());
        self
    }

    /// Sets the artist the instance belongs to.
    pub fn artist_id(mut self, subject_id: impl Into<String>) -> Self {
        self.artist_id = Some(subject_id.into());
        self
    }

    /// Sets the creator.
    pub fn created_by(mut self, subject_id: impl Into<String>) -> Self {
        self.created_by = Some(subject_id.into());
        self
    }

    /// Sets the owner.
    pub fn owner_id(mut self, subject_id: impl Into<String>) -> Self {
        self.owner_id = Some(subject_id.into());
        self
    }

    /// Appends a member.
    pub fn member(mut self, subject_id: impl Into<String>) -> Self {
        self.members.push(Member {
            user_id: subject_id.into(),
        });
        self
    }

    /// Sets the workflow status.
    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}

/// The per-call bundle of subject, organization, role and optional target
/// instance that a decision is made for. Never stored past the decision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecisionContext {
    /// Opaque id of the caller. Blank ids are denied.
    pub subject_id: String,
    /// Tenant the request is made in.
    pub organization_id: Option<String>,
    /// The caller's role. `None` is denied.
    pub role: Option<Role>,
    /// Target instance id, if the request is about one.
    pub resource_id: Option<String>,
    /// Fields of the target instance, loaded by the host.
    pub resource_data: Option<ResourceData>,
}

impl DecisionContext {
    /// A context for `subject_id` acting as `role`.
    pub fn new(subject_id: impl Into<String>, role: Role) -> Self {
        Self {
            subject_id: subject_id.into(),
            role: Some(role),
            ..Self::default()
        }
    }

    /// Builds a context from identity claims. An unrecognised role name
    /// leaves the role empty, which the engine denies.
    pub fn from_claims(
        subject_id: impl Into<String>,
        organization_id: Option<String>,
        role: &str,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            organization_id,
            role: role.parse().ok(),
            ..Self::default()
        }
    }

    /// Sets the organization the request is made in.
    pub fn in_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    /// Targets one instance. Also what `self` conditions compare against.
    pub fn for_instance(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Attaches the instance fields conditions read.
    pub fn with_resource_data(mut self, data: ResourceData) -> Self {
        self.resource_data = Some(data);
        self
    }

    /// Returns the role if the context carries everything a decision needs.
    pub fn validate(&self) -> Result<Role, ContextError> {
        if self.subject_id.trim().is_empty() {
            return Err(ContextError::MissingSubject);
        }
        self.role.ok_or(ContextError::MissingRole)
    }
}

// ---------------------------------------------------------------------------
// Permission catalog
// ---------------------------------------------------------------------------

/// Read-only table mapping each role to its ordered permissions.
///
/// Total by construction: a role without an entry has no permissions, so
/// everything it asks for is denied.
#[derive(Debug, Clone, Default)]
pub struct PermissionCatalog {
    grants: HashMap<Role, Vec<Permission>>,
}

impl PermissionCatalog {
    /// An empty builder.
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// Permissions of `role` in catalog order.
    pub fn permissions_for(&self, role: Role) -> &[Permission] {
        self.grants.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Like [`permissions_for`](Self::permissions_for) for a role name as it
    /// arrives from an identity provider. Unknown names have no permissions.
    pub fn permissions_for_name(&self, role: &str) -> &[Permission] {
        match role.parse::<Role>() {
            Ok(role) => self.permissions_for(role),
            Err(_) => &[],
        }
    }

    /// Roles that have at least one grant.
    pub fn roles(&self) -> impl Iterator<Item = Role> + '_ {
        self.grants.keys().copied()
    }

    /// The marketplace catalog.
    pub fn standard() -> Self {
        let drafts = || Condition::status_in(["DRAFT", "PENDING"]);

        Self::builder()
            .grant(Role::SuperAdmin, Permission::everything())
            .grant_all(
                Role::OrgAdmin,
                [
                    Permission::new(Resource::Organization, Action::Read),
                    Permission::new(Resource::Organization, Action::Update),
                    Permission::new(Resource::User, Action::Manage),
                    Permission::new(Resource::Artist, Action::Manage),
                    Permission::new(Resource::Booking, Action::Manage),
                    Permission::new(Resource::Project, Action::Manage),
                    Permission::new(Resource::Contract, Action::Manage),
                    Permission::new(Resource::Invoice, Action::Manage),
                    Permission::new(Resource::Subscription, Action::Manage),
                    Permission::new(Resource::Settings, Action::Manage),
                    Permission::new(Resource::Analytics, Action::Read)
                        .when(Condition::Scope(DataScope::Financial)),
                    Permission::new(Resource::Analytics, Action::Export)
                        .when(Condition::Scope(DataScope::Financial)),
                ],
            )
            .grant_all(
                Role::LabelManager,
                [
                    Permission::new(Resource::Organization, Action::Read),
                    Permission::new(Resource::User, Action::Read),
                    Permission::new(Resource::Artist, Action::Manage),
                    Permission::new(Resource::Booking, Action::Manage),
                    Permission::new(Resource::Project, Action::Manage),
                    Permission::new(Resource::Contract, Action::Create),
                    Permission::new(Resource::Contract, Action::Read),
                    Permission::new(Resource::Contract, Action::Update),
                    Permission::new(Resource::Invoice, Action::Read),
                    Permission::new(Resource::Analytics, Action::Read)
                        .when(Condition::Scope(DataScope::Basic)),
                ],
            )
            .grant_all(
                Role::ArtistManager,
                [
                    Permission::new(Resource::Artist, Action::Read),
                    Permission::new(Resource::Artist, Action::Update).when(Condition::Assigned),
                    Permission::new(Resource::Booking, Action::Create),
                    Permission::new(Resource::Booking, Action::Read).when(Condition::Assigned),
                    Permission::new(Resource::Booking, Action::Update)
                        .when(Condition::Assigned)
                        .when(drafts()),
                    Permission::new(Resource::Project, Action::Read).when(Condition::Assigned),
                    Permission::new(Resource::Project, Action::Update).when(Condition::Assigned),
                    Permission::new(Resource::Contract, Action::Read).when(Condition::Assigned),
                    Permission::new(Resource::Analytics, Action::Read)
                        .when(Condition::Scope(DataScope::Assigned)),
                ],
            )
            .grant_all(
                Role::StudioManager,
                [
                    Permission::new(Resource::Booking, Action::Read),
                    Permission::new(Resource::Booking, Action::Update)
                        .when(Condition::status_in(["DRAFT", "PENDING", "CONFIRMED"])),
                    Permission::new(Resource::Booking, Action::Approve),
                    Permission::new(Resource::Project, Action::Read),
                    Permission::new(Resource::Settings, Action::Read)
                        .when(Condition::role_in([Role::StudioManager])),
                    Permission::new(Resource::Analytics, Action::Read)
                        .when(Condition::Scope(DataScope::Studio)),
                ],
            )
            .grant_all(
                Role::Accountant,
                [
                    Permission::new(Resource::Invoice, Action::Manage),
                    Permission::new(Resource::Contract, Action::Read),
                    Permission::new(Resource::Subscription, Action::Read),
                    Permission::new(Resource::Booking, Action::Read),
                    Permission::new(Resource::Analytics, Action::Read)
                        .when(Condition::Scope(DataScope::Financial)),
                    Permission::new(Resource::Analytics, Action::Export)
                        .when(Condition::Scope(DataScope::Financial)),
                ],
            )
            .grant_all(
                Role::Creator,
                [
                    Permission::new(Resource::User, Action::Read).when(Condition::IsSelf),
                    Permission::new(Resource::User, Action::Update).when(Condition::IsSelf),
                    Permission::new(Resource::Artist, Action::Read),
                    Permission::new(Resource::Artist, Action::Update).when(Condition::Owner),
                    Permission::new(Resource::Booking, Action::Read).when(Condition::Assigned),
                    Permission::new(Resource::Booking, Action::Update)
                        .when(Condition::Assigned)
                        .when(drafts()),
                    Permission::new(Resource::Project, Action::Create),
                    Permission::new(Resource::Project, Action::Read).when(Condition::Member),
                    Permission::new(Resource::Project, Action::Update).when(Condition::Member),
                    Permission::new(Resource::Contract, Action::Read).when(Condition::Assigned),
                    Permission::new(Resource::Invoice, Action::Read).when(Condition::Assigned),
                    Permission::new(Resource::Analytics, Action::Read)
                        .when(Condition::Scope(DataScope::Own)),
                ],
            )
            .grant_all(
                Role::Client,
                [
                    Permission::new(Resource::User, Action::Read).when(Condition::IsSelf),
                    Permission::new(Resource::User, Action::Update).when(Condition::IsSelf),
                    Permission::new(Resource::Artist, Action::Read),
                    Permission::new(Resource::Booking, Action::Create),
                    Permission::new(Resource::Booking, Action::Read).when(Condition::Created),
                    Permission::new(Resource::Booking, Action::Update)
                        .when(Condition::Created)
                        .when(Condition::status_in(["DRAFT"])),
                    Permission::new(Resource::Booking, Action::Delete)
                        .when(Condition::Created)
                        .when(Condition::status_in(["DRAFT"])),
                    Permission::new(Resource::Project, Action::Read).when(Condition::Member),
                    Permission::new(Resource::Invoice, Action::Read).when(Condition::Owner),
                ],
            )
            .grant_all(
                Role::Viewer,
                [
                    Permission::new(Resource::Organization, Action::Read),
                    Permission::new(Resource::Artist, Action::Read),
                    Permission::new(Resource::Analytics, Action::Read)
                        .when(Condition::Scope(DataScope::Basic)),
                ],
            )
            .build()
    }
}

/// Assembles a [`PermissionCatalog`]. Grants keep insertion order.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    grants: HashMap<Role, Vec<Permission>>,
}

impl CatalogBuilder {
    /// Appends one permission to `role`.
    pub fn grant(mut self, role: Role, permission: Permission) -> Self {
        self.grants.entry(role).or_default().push(permission);
        self
    }

    /// Appends several permissions to `role`, keeping their order.
    pub fn grant_all(mut self, role: Role, permissions: impl IntoIterator<Item = Permission>) -> Self {
        self.grants.entry(role).or_default().extend(permissions);
        self
    }

    /// Freezes the grants into a catalog.
    pub fn build(self) -> PermissionCatalog {
        PermissionCatalog {
            grants: self.grants,
        }
    }
}

// ---------------------------------------------------------------------------
// Condition evaluation
// ---------------------------------------------------------------------------

/// Decides whether one condition holds for a decision context.
///
/// Implementations must be pure: the engine caches verdicts and assumes the
/// same inputs always yield the same answer.
pub trait ConditionEvaluator: Send + Sync {
    /// Whether `condition` is true for `context`.
    fn holds(&self, condition: &Condition, context: &DecisionContext) -> bool;
}

/// The built-in condition semantics.
///
/// Every condition that reads instance data is false when
/// [`DecisionContext::resource_data`] is absent. `scope=` always holds.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardConditions;

impl ConditionEvaluator for StandardConditions {
    fn holds(&self, condition: &Condition, context: &DecisionContext) -> bool {
        let subject = context.subject_id.as_str();
        let is_subject = |field: Option<&str>| !subject.is_empty() && field == Some(subject);
        let data = context.resource_data.as_ref();

        match condition {
            Condition::IsSelf => is_subject(context.resource_id.as_deref()),
            Condition::Assigned => data.is_some_and(|data| {
                [&data.assigned_to, &data.artist_id, &data.created_by]
                    .into_iter()
                    .any(|field| is_subject(field.as_deref()))
            }),
            Condition::Created => data.is_some_and(|data| is_subject(data.created_by.as_deref())),
            Condition::Owner => data.is_some_and(|data| is_subject(data.owner_id.as_deref())),
            Condition::Member => data.is_some_and(|data| {
                data.members
                    .iter()
                    .any(|member| is_subject(Some(member.user_id.as_str())))
            }),
            Condition::RoleIn(roles) => context.role.is_some_and(|role| roles.contains(&role)),
            Condition::StatusIn(statuses) => data
                .and_then(|data| data.status.as_deref())
                .is_some_and(|status| {
                    statuses
                        .iter()
                        .any(|allowed| allowed.eq_ignore_ascii_case(status))
                }),
            Condition::Scope(_) => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Decision cache
// ---------------------------------------------------------------------------

/// Source of time for cache expiry.
pub trait Clock: Send + Sync + fmt::Debug {
    /// The current instant.
    fn now(&self) -> Instant;
}

/// Wall-clock time from [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    elapsed_millis: Arc<AtomicU64>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// A clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed_millis: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Moves the clock forward. Resolution is one millisecond.
    pub fn advance(&self, by: Duration) {
        let millis = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.elapsed_millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + Duration::from_millis(self.elapsed_millis.load(Ordering::SeqCst))
    }
}

/// Identifies one cached verdict.
///
/// Besides the subject, resource, action and instance shown by `Display`,
/// the key carries the caller's role and the instance data, so a verdict is
/// only reused for the exact context it was computed for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    subject_id: String,
    resource: Resource,
    action: Action,
    instance: Option<String>,
    role: Option<Role>,
    data: Option<ResourceData>,
}

impl CacheKey {
    /// The key under which the verdict for `context` is cached.
    pub fn new(context: &DecisionContext, resource: Resource, action: Action) -> Self {
        Self {
            subject_id: context.subject_id.clone(),
            resource,
            action,
            instance: context.resource_id.clone(),
            role: context.role,
            data: context.resource_data.clone(),
        }
    }

    /// The subject the verdict belongs to.
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.subject_id,
            self.resource,
            self.action,
            self.instance.as_deref().unwrap_or("all")
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    verdict: bool,
    written_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.written_at) >= self.ttl
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries currently stored, expired ones included.
    pub entries: usize,
    /// Lookups that returned a verdict.
    pub hits: u64,
    /// Lookups that found nothing or an expired entry.
    pub misses: u64,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Process-local, short-lived memo of computed verdicts.
///
/// Expired entries are never returned: they are dropped on read, and
/// [`purge_expired`](Self::purge_expired) sweeps the rest. Nothing is
/// persisted, so a fresh process starts cold.
#[derive(Debug, Clone)]
pub struct DecisionCache {
    entries: Arc<DashMap<CacheKey, CacheEntry>>,
    counters: Arc<CacheCounters>,
    clock: Arc<dyn Clock>,
    max_entries: usize,
    eviction_batch_size: usize,
}

impl DecisionCache {
    /// A cache sized from `config`, driven by the system clock.
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Like [`new`](Self::new) with an explicit time source.
    pub fn with_clock(config: &EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            counters: Arc::new(CacheCounters::default()),
            clock,
            max_entries: config.max_cache_entries,
            eviction_batch_size: config.eviction_batch_size.max(1),
        }
    }

    /// The cached verdict for `key`, or `None` on a miss or expiry.
    pub fn get(&self, key: &CacheKey) -> Option<bool> {
        let now = self.clock.now();
        let entry = self.entries.get(key).map(|entry| *entry);

        match entry {
            Some(entry) if !entry.is_expired(now) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.verdict)
            }
            Some(_) => {
                self.entries.remove_if(key, |_, entry| entry.is_expired(now));
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores a verdict. Concurrent writers of one key race harmlessly; the
    /// last write wins.
    pub fn put(&self, key: CacheKey, verdict: bool, ttl: Duration) {
        if !self.entries.contains_key(&key) {
            self.evict_if_needed();
        }
        let entry = CacheEntry {
            verdict,
            written_at: self.clock.now(),
            ttl,
        };
        self.entries.insert(key, entry);
    }

    /// Drops every entry of `subject_id` and returns how many were removed.
    pub fn invalidate_subject(&self, subject_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.subject_id != subject_id);
        before.saturating_sub(self.entries.len())
    }

    /// Drops every entry.
    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    /// Removes expired entries. Hosts may call this on a timer.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current entry count and hit/miss counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
        }
    }

    // A `max_entries` of zero leaves the cache unbounded.
    fn evict_if_needed(&self) {
        if self.max_entries == 0 || self.entries.len() < self.max_entries {
            return;
        }

        self.purge_expired();

        let current_len = self.entries.len();
        if current_len < self.max_entries {
            return;
        }

        let target_size = self.max_entries.saturating_sub(self.eviction_batch_size);
        let to_evict = current_len.saturating_sub(target_size);

        let mut oldest: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.written_at))
            .collect();
        oldest.sort_by_key(|(_, written_at)| *written_at);

        for (key, _) in oldest.into_iter().take(to_evict) {
            self.entries.remove(&key);
        }
        tracing::debug!(evicted = to_evict, "Decision cache at capacity");
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Engine settings. Deserializable so hosts can embed it in their own
/// configuration files; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Whether verdicts are cached at all.
    pub cache_enabled: bool,
    /// Verdict lifetime in seconds. Zero disables caching.
    pub cache_ttl_secs: u64,
    /// Zero means unbounded.
    pub max_cache_entries: usize,
    /// Entries dropped at once when the cache is full.
    pub eviction_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            max_cache_entries: DEFAULT_MAX_CACHE_ENTRIES,
            eviction_batch_size: DEFAULT_EVICTION_BATCH_SIZE,
        }
    }
}

impl EngineConfig {
    /// The default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Turns verdict caching on or off.
    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// Sets the verdict lifetime, rounded up to whole seconds.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
        self
    }

    /// Caps the entry count. Zero means unbounded.
    pub fn with_max_cache_entries(mut self, max_entries: usize) -> Self {
        self.max_cache_entries = max_entries;
        self
    }

    /// How many of the oldest entries go when the cache is full. Clamped to at least one.
    pub fn with_eviction_batch_size(mut self, batch_size: usize) -> Self {
        self.eviction_batch_size = batch_size;
        self
    }

    /// Verdict lifetime as a `Duration`.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

// ---------------------------------------------------------------------------
// Evaluation results
// ---------------------------------------------------------------------------

/// One node of an evaluation trace.
///
/// - [`PolicyEvalResult::Granted`]: a rule allowed access, with an optional reason.
/// - [`PolicyEvalResult::Denied`]: a rule denied access, with an explanation.
/// - [`PolicyEvalResult::AllOf`]: a rule whose children must all grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEvalResult {
    /// A rule allowed access.
    Granted {
        rule: String,
        reason: Option<String>,
    },
    /// A rule denied access.
    Denied {
        rule: String,
        reason: String,
    },
    /// A rule whose children must all grant.
    AllOf {
        rule: String,
        children: Vec<PolicyEvalResult>,
        outcome: bool,
    },
}

impl PolicyEvalResult {
    /// Whether this node allowed access.
    pub fn is_granted(&self) -> bool {
        match self {
            Self::Granted { .. } => true,
            Self::Denied { .. } => false,
            Self::AllOf { outcome, .. } => *outcome,
        }
    }

    /// Name of the rule at this node.
    pub fn rule(&self) -> &str {
        match self {
            Self::Granted { rule, .. } | Self::Denied { rule, .. } | Self::AllOf { rule, .. } => {
                rule
            }
        }
    }

    /// The reason given at this node. `AllOf` nodes carry none.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Granted { reason, .. } => reason.as_deref(),
            Self::Denied { reason, .. } => Some(reason),
            Self::AllOf { .. } => None,
        }
    }

    /// Formats the tree with two spaces of indentation per level.
    pub fn format(&self, indent: usize) -> String {
        let indent_str = " ".repeat(indent);

        match self {
            Self::Granted { rule, reason } => {
                let reason_text = reason
                    .as_ref()
                    .map_or(String::new(), |r| format!(": {}", r));
                format!("{}✔ {} GRANTED{}", indent_str, rule, reason_text)
            }
            Self::Denied { rule, reason } => {
                format!("{}✘ {} DENIED: {}", indent_str, rule, reason)
            }
            Self::AllOf {
                rule,
                children,
                outcome,
            } => {
                let outcome_char = if *outcome { "✔" } else { "✘" };
                let mut result = format!("{}{} {} (AND)", indent_str, outcome_char, rule);
                for child in children {
                    result.push_str(&format!("\n{}", child.format(indent + 2)));
                }
                result
            }
        }
    }
}

impl fmt::Display for PolicyEvalResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format(0))
    }
}

/// Container for the evaluation tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvalTrace {
    root: Option<PolicyEvalResult>,
}

impl EvalTrace {
    /// An empty trace.
    pub fn new() -> Self {
        Self { root: None }
    }

    /// A trace rooted at `result`.
    pub fn with_root(result: PolicyEvalResult) -> Self {
        Self { root: Some(result) }
    }

    /// The root node, if any.
    pub fn root(&self) -> Option<&PolicyEvalResult> {
        self.root.as_ref()
    }

    /// Takes the root node out of the trace.
    pub fn into_root(self) -> Option<PolicyEvalResult> {
        self.root
    }

    /// The indented trace, or a placeholder when empty.
    pub fn format(&self) -> String {
        match &self.root {
            Some(root) => root.format(0),
            None => "No evaluation trace available".to_string(),
        }
    }
}

/// The complete result of a decision: the verdict plus a trace for
/// debugging and audit.
///
/// ```rust
/// use greenroom::*;
///
/// let engine = PolicyEngine::new(PermissionCatalog::standard());
/// let client = DecisionContext::new("u1", Role::Client).for_instance("u2");
///
/// match engine.evaluate(&client, Resource::User, Action::Read) {
///     AccessEvaluation::Granted { rule, .. } => panic!("unexpectedly granted by {rule}"),
///     AccessEvaluation::Denied { reason, trace } => {
///         assert_eq!(reason, DenyReason::ConditionFailed(Condition::IsSelf));
///         assert!(trace.format().contains("condition:self"));
///     }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessEvaluation {
    /// Access is allowed.
    Granted {
        /// The rule that granted access.
        rule: String,
        reason: Option<String>,
        trace: EvalTrace,
    },
    /// Access is denied.
    Denied {
        reason: DenyReason,
        trace: EvalTrace,
    },
}

impl AccessEvaluation {
    fn granted(root: PolicyEvalResult) -> Self {
        Self::Granted {
            rule: root.rule().to_string(),
            reason: root.reason().map(str::to_string),
            trace: EvalTrace::with_root(root),
        }
    }

    fn denied(reason: DenyReason, root: PolicyEvalResult) -> Self {
        Self::Denied {
            reason,
            trace: EvalTrace::with_root(root),
        }
    }

    fn from_cache(verdict: bool) -> Self {
        if verdict {
            Self::granted(PolicyEvalResult::Granted {
                rule: CACHE_RULE.to_string(),
                reason: Some("cached verdict".to_string()),
            })
        } else {
            Self::denied(
                DenyReason::Cached,
                PolicyEvalResult::Denied {
                    rule: CACHE_RULE.to_string(),
                    reason: DenyReason::Cached.to_string(),
                },
            )
        }
    }

    /// Whether access was granted.
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }

    /// The trace behind the verdict.
    pub fn trace(&self) -> &EvalTrace {
        match self {
            Self::Granted { trace, .. } | Self::Denied { trace, .. } => trace,
        }
    }

    /// The rule at the root of the trace.
    pub fn rule(&self) -> &str {
        match self {
            Self::Granted { rule, .. } => rule,
            Self::Denied { trace, .. } => trace.root().map_or(ENGINE_RULE, PolicyEvalResult::rule),
        }
    }

    /// Converts the evaluation into a `Result`, mapping a denial into an error.
    pub fn to_result<E>(&self, error_fn: impl FnOnce(&DenyReason) -> E) -> Result<(), E> {
        match self {
            Self::Granted { .. } => Ok(()),
            Self::Denied { reason, .. } => Err(error_fn(reason)),
        }
    }

    /// The summary line followed by the full trace.
    pub fn display_trace(&self) -> String {
        format!("{}\nEvaluation Trace:\n{}", self, self.trace().format())
    }
}

/// A concise line about the final decision.
impl fmt::Display for AccessEvaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Granted { rule, reason, .. } => match reason {
                Some(r) => write!(f, "[GRANTED] by {} - {}", rule, r),
                None => write!(f, "[GRANTED] by {}", rule),
            },
            Self::Denied { reason, .. } => write!(f, "[Denied] - {}", reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Policy engine
// ---------------------------------------------------------------------------

/// Answers access questions against a [`PermissionCatalog`].
///
/// Build one at process start and hand clones to request handlers; clones
/// share the catalog and the decision cache.
#[derive(Clone)]
pub struct PolicyEngine {
    catalog: Arc<PermissionCatalog>,
    evaluator: Arc<dyn ConditionEvaluator>,
    cache: DecisionCache,
    config: EngineConfig,
}

impl fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("catalog", &self.catalog)
            .field("cache", &self.cache.stats())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PolicyEngine {
    /// An engine over `catalog` with the standard conditions and default
    /// configuration.
    pub fn new(catalog: PermissionCatalog) -> Self {
        Self::builder().catalog(catalog).build()
    }

    /// Starts a [`PolicyEngineBuilder`].
    pub fn builder() -> PolicyEngineBuilder {
        PolicyEngineBuilder::default()
    }

    /// The roles and permissions this engine checks against.
    pub fn catalog(&self) -> &PermissionCatalog {
        &self.catalog
    }

    /// The shared decision cache.
    pub fn cache(&self) -> &DecisionCache {
        &self.cache
    }

    /// The settings this engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether the subject of `context` may perform `action` on `resource`.
    pub fn check_permission(
        &self,
        context: &DecisionContext,
        resource: Resource,
        action: Action,
    ) -> bool {
        self.evaluate(context, resource, action).is_granted()
    }

    /// Like [`check_permission`](Self::check_permission), returning the full
    /// [`AccessEvaluation`].
    ///
    /// Malformed contexts are denied and never cached.
    #[tracing::instrument(skip_all, fields(resource = %resource, action = %action))]
    pub fn evaluate(
        &self,
        context: &DecisionContext,
        resource: Resource,
        action: Action,
    ) -> AccessEvaluation {
        let role = match context.validate() {
            Ok(role) => role,
            Err(err) => {
                tracing::warn!(error = %err, "Denying malformed decision context");
                return AccessEvaluation::denied(
                    DenyReason::MalformedContext(err),
                    PolicyEvalResult::Denied {
                        rule: ENGINE_RULE.to_string(),
                        reason: err.to_string(),
                    },
                );
            }
        };

        let key = CacheKey::new(context, resource, action);
        if self.config.cache_enabled {
            if let Some(verdict) = self.cache.get(&key) {
                tracing::trace!(%key, verdict, "Decision cache hit");
                return AccessEvaluation::from_cache(verdict);
            }
            tracing::trace!(%key, "Decision cache miss");
        }

        let evaluation = self.decide(role, context, resource, action);
        self.record_decision(role, resource, action, &evaluation);

        let ttl = self.config.cache_ttl();
        if self.config.cache_enabled && !ttl.is_zero() {
            self.cache.put(key, evaluation.is_granted(), ttl);
        }
        evaluation
    }

    /// Every action in [`Action::ALL`] that
    /// [`check_permission`](Self::check_permission) allows on `resource`.
    pub fn get_allowed_actions(&self, context: &DecisionContext, resource: Resource) -> Vec<Action> {
        Action::ALL
            .into_iter()
            .filter(|action| self.check_permission(context, resource, *action))
            .collect()
    }

    /// Checks several (resource, action) pairs at once.
    pub fn check_multiple_permissions(
        &self,
        context: &DecisionContext,
        pairs: impl IntoIterator<Item = (Resource, Action)>,
    ) -> HashMap<(Resource, Action), bool> {
        pairs
            .into_iter()
            .map(|(resource, action)| {
                (
                    (resource, action),
                    self.check_permission(context, resource, action),
                )
            })
            .collect()
    }

    /// Whether the subject may run bulk operations on `resource`.
    pub fn can_perform_bulk_operation(&self, context: &DecisionContext, resource: Resource) -> bool {
        self.check_permission(context, resource, Action::BulkOperation)
    }

    /// The data scope a granted request should be filtered to, or `None` when
    /// the request is denied.
    pub fn data_scope(
        &self,
        context: &DecisionContext,
        resource: Resource,
        action: Action,
    ) -> Option<DataScope> {
        if !self.check_permission(context, resource, action) {
            return None;
        }
        let permissions = self.catalog.permissions_for(context.role?);
        if permissions.iter().any(Permission::is_wildcard) {
            return Some(DataScope::All);
        }
        permissions
            .iter()
            .find(|permission| permission.matches(resource, action))
            .map(|permission| permission.scope().unwrap_or(DataScope::All))
    }

    /// Whether the assigner may grant `new_role` to `target_subject_id`. See
    /// [`RoleAssignmentGuard`].
    pub fn assign_role(
        &self,
        assigner: &DecisionContext,
        target_subject_id: &str,
        new_role: Role,
    ) -> bool {
        RoleAssignmentGuard::new(self).assign_role(assigner, target_subject_id, new_role)
    }

    /// Drops every cached verdict of `subject_id`. Call after the subject's
    /// role or relationships change.
    pub fn invalidate_subject_cache(&self, subject_id: &str) -> usize {
        let removed = self.cache.invalidate_subject(subject_id);
        tracing::debug!(subject_id, removed, "Invalidated subject decisions");
        removed
    }

    /// Drops every cached verdict. Call after a catalog or evaluator swap.
    pub fn invalidate_all_cache(&self) {
        self.cache.invalidate_all();
        tracing::debug!("Invalidated all cached decisions");
    }

    fn decide(
        &self,
        role: Role,
        context: &DecisionContext,
        resource: Resource,
        action: Action,
    ) -> AccessEvaluation {
        let permissions = self.catalog.permissions_for(role);

        if let Some(wildcard) = permissions.iter().find(|p| p.is_wildcard()) {
            return AccessEvaluation::granted(PolicyEvalResult::Granted {
                rule: wildcard.to_string(),
                reason: Some(format!("{} holds every permission", role)),
            });
        }

        // First match in catalog order decides, even if its conditions fail.
        let Some(permission) = permissions.iter().find(|p| p.matches(resource, action)) else {
            let reason = DenyReason::NoMatchingPermission {
                role,
                resource,
                action,
            };
            return AccessEvaluation::denied(
                reason.clone(),
                PolicyEvalResult::Denied {
                    rule: role.to_string(),
                    reason: reason.to_string(),
                },
            );
        };

        if permission.conditions().is_empty() {
            return AccessEvaluation::granted(PolicyEvalResult::Granted {
                rule: permission.to_string(),
                reason: Some("unconditional permission".to_string()),
            });
        }

        let mut children = Vec::with_capacity(permission.conditions().len());
        for condition in permission.conditions() {
            let rule = format!("condition:{}", condition);
            match self.holds(condition, context) {
                Ok(true) => children.push(PolicyEvalResult::Granted { rule, reason: None }),
                Ok(false) => {
                    let reason = DenyReason::ConditionFailed(condition.clone());
                    children.push(PolicyEvalResult::Denied {
                        rule,
                        reason: reason.to_string(),
                    });
                    return AccessEvaluation::denied(
                        reason,
                        PolicyEvalResult::AllOf {
                            rule: permission.to_string(),
                            children,
                            outcome: false,
                        },
                    );
                }
                Err(reason) => {
                    children.push(PolicyEvalResult::Denied {
                        rule,
                        reason: reason.to_string(),
                    });
                    return AccessEvaluation::denied(
                        reason,
                        PolicyEvalResult::AllOf {
                            rule: permission.to_string(),
                            children,
                            outcome: false,
                        },
                    );
                }
            }
        }

        let root = PolicyEvalResult::AllOf {
            rule: permission.to_string(),
            children,
            outcome: true,
        };
        AccessEvaluation::Granted {
            rule: permission.to_string(),
            reason: Some("all conditions hold".to_string()),
            trace: EvalTrace::with_root(root),
        }
    }

    // A panicking evaluator denies instead of unwinding into the caller.
    fn holds(&self, condition: &Condition, context: &DecisionContext) -> Result<bool, DenyReason> {
        panic::catch_unwind(AssertUnwindSafe(|| self.evaluator.holds(condition, context))).map_err(
            |_| {
                tracing::error!(condition = %condition, "Condition evaluator panicked");
                DenyReason::EvaluationFault(condition.clone())
            },
        )
    }

    fn record_decision(
        &self,
        role: Role,
        resource: Resource,
        action: Action,
        evaluation: &AccessEvaluation,
    ) {
        let event_outcome = if evaluation.is_granted() {
            "success"
        } else {
            "failure"
        };
        let reason = match evaluation {
            AccessEvaluation::Granted { reason, .. } => reason.clone(),
            AccessEvaluation::Denied { reason, .. } => Some(reason.to_string()),
        };

        tracing::trace!(
            target: "greenroom::security",
            {
                security_rule.name = evaluation.rule(),
                security_rule.category = SECURITY_RULE_CATEGORY,
                security_rule.ruleset.name = role.as_str(),
                event.outcome = event_outcome,
                resource = resource.as_str(),
                action = action.as_str(),
                policy.result.reason = reason.as_deref(),
            },
            "Security rule evaluated"
        );
    }
}

/// Assembles a [`PolicyEngine`].
#[derive(Default)]
pub struct PolicyEngineBuilder {
    catalog: Option<PermissionCatalog>,
    evaluator: Option<Arc<dyn ConditionEvaluator>>,
    clock: Option<Arc<dyn Clock>>,
    config: EngineConfig,
}

impl PolicyEngineBuilder {
    /// Defaults to [`PermissionCatalog::standard`].
    pub fn catalog(mut self, catalog: PermissionCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Defaults to [`StandardConditions`].
    pub fn evaluator(mut self, evaluator: impl ConditionEvaluator + 'static) -> Self {
        self.evaluator = Some(Arc::new(evaluator));
        self
    }

    /// Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Defaults to [`EngineConfig::default`].
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to the standard catalog when none was given.
    pub fn build(self) -> PolicyEngine {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        PolicyEngine {
            catalog: Arc::new(self.catalog.unwrap_or_else(PermissionCatalog::standard)),
            evaluator: self
                .evaluator
                .unwrap_or_else(|| Arc::new(StandardConditions)),
            cache: DecisionCache::with_clock(&self.config, clock),
            config: self.config,
        }
    }
}

// ---------------------------------------------------------------------------
// Role assignment
// ---------------------------------------------------------------------------

/// Governs who may grant which roles.
///
/// The assigner needs `user:manage`, and only a super admin may create
/// another super admin. The second rule lives here rather than in the
/// catalog so no catalog edit can lift it. Persisting the new role is up to
/// the caller, who should then call
/// [`PolicyEngine::invalidate_subject_cache`] for the target.
#[derive(Debug, Clone, Copy)]
pub struct RoleAssignmentGuard<'a> {
    engine: &'a PolicyEngine,
}

impl<'a> RoleAssignmentGuard<'a> {
    /// A guard that checks assignments against `engine`.
    pub fn new(engine: &'a PolicyEngine) -> Self {
        Self { engine }
    }

    /// Whether the assigner may give `new_role` to `target_subject_id`.
    pub fn assign_role(
        &self,
        assigner: &DecisionContext,
        target_subject_id: &str,
        new_role: Role,
    ) -> bool {
        self.evaluate(assigner, target_subject_id, new_role)
            .is_granted()
    }

    /// Like [`assign_role`](Self::assign_role) but returns the traced evaluation.
    ///
    /// Logs one `info` event on `greenroom::security` per call.
    pub fn evaluate(
        &self,
        assigner: &DecisionContext,
        target_subject_id: &str,
        new_role: Role,
    ) -> AccessEvaluation {
        let evaluation = self.decide(assigner, target_subject_id, new_role);
        let event_outcome = if evaluation.is_granted() {
            "success"
        } else {
            "failure"
        };
        tracing::info!(
            target: "greenroom::security",
            assigner = %assigner.subject_id,
            target_subject = target_subject_id,
            new_role = new_role.as_str(),
            event.outcome = event_outcome,
            "Role assignment evaluated"
        );
        evaluation
    }

    fn decide(
        &self,
        assigner: &DecisionContext,
        target_subject_id: &str,
        new_role: Role,
    ) -> AccessEvaluation {
        let mut children = Vec::with_capacity(2);

        if target_subject_id.trim().is_empty() {
            let err = ContextError::MissingTarget;
            children.push(PolicyEvalResult::Denied {
                rule: GUARD_RULE.to_string(),
                reason: err.to_string(),
            });
            return Self::finish(Err(DenyReason::MalformedContext(err)), children);
        }

        match self.engine.evaluate(assigner, Resource::User, Action::Manage) {
            AccessEvaluation::Denied { reason, trace } => {
                children.extend(trace.into_root());
                return Self::finish(Err(reason), children);
            }
            AccessEvaluation::Granted { trace, .. } => children.extend(trace.into_root()),
        }

        if new_role == Role::SuperAdmin && assigner.role != Some(Role::SuperAdmin) {
            let reason = DenyReason::PrivilegeEscalation(Role::SuperAdmin);
            children.push(PolicyEvalResult::Denied {
                rule: ESCALATION_RULE.to_string(),
                reason: reason.to_string(),
            });
            return Self::finish(Err(reason), children);
        }

        children.push(PolicyEvalResult::Granted {
            rule: ESCALATION_RULE.to_string(),
            reason: None,
        });
        Self::finish(Ok(()), children)
    }

    fn finish(
        verdict: Result<(), DenyReason>,
        children: Vec<PolicyEvalResult>,
    ) -> AccessEvaluation {
        let root = PolicyEvalResult::AllOf {
            rule: GUARD_RULE.to_string(),
            children,
            outcome: verdict.is_ok(),
        };
        match verdict {
            Ok(()) => AccessEvaluation::Granted {
                rule: GUARD_RULE.to_string(),
                reason: Some("assigner may grant this role".to_string()),
                trace: EvalTrace::with_root(root),
            },
            Err(reason) => AccessEvaluation::denied(reason, root),
        }
    }
}

// ---------------------------------------------------------------------------
// Route protection
// ---------------------------------------------------------------------------

/// Loads the instance fields a check needs. Implemented by the host's
/// data-access layer.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    /// `None` when the instance does not exist or cannot be read.
    async fn load(&self, resource: Resource, instance_id: &str) -> Option<ResourceData>;
}

/// A resource and action bound to an engine at route-registration time.
///
/// ```rust
/// use async_trait::async_trait;
/// use greenroom::*;
///
/// struct Bookings;
///
/// #[async_trait]
/// impl ResourceLoader for Bookings {
///     async fn load(&self, _resource: Resource, _instance_id: &str) -> Option<ResourceData> {
///         Some(ResourceData::new().created_by("client-1").status("DRAFT"))
///     }
/// }
///
/// let engine = PolicyEngine::new(PermissionCatalog::standard());
/// let guard = RouteGuard::new(engine, Resource::Booking, Action::Delete);
///
/// # tokio_test::block_on(async {
/// let owner = DecisionContext::new("client-1", Role::Client);
/// assert!(guard.authorize_instance(owner, "b-1", &Bookings).await.is_ok());
///
/// let stranger = DecisionContext::new("client-2", Role::Client);
/// let denied = guard.authorize_instance(stranger, "b-1", &Bookings).await.unwrap_err();
/// assert_eq!(denied.reason, DenyReason::ConditionFailed(Condition::Created));
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct RouteGuard {
    engine: PolicyEngine,
    resource: Resource,
    action: Action,
}

impl RouteGuard {
    /// A guard checking `action` on `resource` for every request.
    pub fn new(engine: PolicyEngine, resource: Resource, action: Action) -> Self {
        Self {
            engine,
            resource,
            action,
        }
    }

    /// The resource checked by this guard.
    pub fn resource(&self) -> Resource {
        self.resource
    }

    /// The action checked by this guard.
    pub fn action(&self) -> Action {
        self.action
    }

    /// Checks the request as-is, with whatever instance data `context` carries.
    pub fn authorize(&self, context: &DecisionContext) -> Result<(), AccessDenied> {
        self.engine
            .evaluate(context, self.resource, self.action)
            .to_result(|reason| AccessDenied {
                resource: self.resource,
                action: self.action,
                reason: reason.clone(),
            })
    }

    /// Loads the instance through `loader`, then authorizes against it. A
    /// missing instance leaves the resource data empty, so data-dependent
    /// conditions deny.
    pub async fn authorize_instance<L>(
        &self,
        context: DecisionContext,
        instance_id: &str,
        loader: &L,
    ) -> Result<(), AccessDenied>
    where
        L: ResourceLoader + ?Sized,
    {
        let data = loader.load(self.resource, instance_id).await;
        if data.is_none() {
            tracing::debug!(resource = %self.resource, instance_id, "No resource data loaded");
        }
        let context = DecisionContext {
            resource_id: Some(instance_id.to_string()),
            resource_data: data,
            ..context
        };
        self.authorize(&context)
    }
}
