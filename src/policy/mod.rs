//! Policy-based access control.
//!
//! A [`Policy`] is a list of [`Statement`]s. Users are bound to policies
//! through [`Member`]s, which carry an ordering `index` and an optional
//! expiry. Given `(user, action, resource, request)` the [`PolicyStore`]
//! walks the user's policies in member order and each policy's statements in
//! declaration order; the first statement whose action glob, resource glob
//! and conditions all match decides. Nothing matching means deny.
//!
//! ```json
//! {
//!   "policy_id": 1,
//!   "name": "readers",
//!   "statement": [{
//!     "effect": true,
//!     "action": ["read:*"],
//!     "resource": ["doc/*"],
//!     "conditions": {"method": ["GET"], "sourceip": ["10.0.0.0/8"]},
//!     "data": {"fields": ["title", "body"]}
//!   }]
//! }
//! ```
//!
//! The store publishes immutable snapshots through `ArcSwap`, so a request
//! evaluates against one coherent view while writers replace it.

mod admin;
mod bearer;
mod condition;
mod glob;
mod middleware;

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::context::Context;
use crate::error::Error;

pub use admin::PolicyAdmin;
pub use bearer::{BearerSigner, Claims};
pub use condition::{ConditionBuilder, ConditionFn, ConditionRegistry};
pub use glob::glob_match;
pub use middleware::{Pbac, VALUE_POLICY_DATA};

use condition::Compiled;

/// Statement data handed to the handler on allow.
pub type StatementData = HashMap<String, Vec<Value>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub policy_id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub statement: Vec<Statement>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    /// `true` allows, `false` denies.
    pub effect: bool,
    pub action: Vec<String>,
    /// Empty matches every resource.
    #[serde(default)]
    pub resource: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub conditions: Map<String, Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: StatementData,
}

/// Binds `user_id` to `policy_id`. Lower `index` is evaluated first; equal
/// indexes keep insertion order. `expiration` is a unix timestamp in seconds,
/// 0 for never.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: u64,
    pub policy_id: u64,
    #[serde(default)]
    pub index: i64,
    #[serde(default)]
    pub expiration: i64,
}

impl Member {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expiration != 0 && self.expiration <= now
    }
}

/// Outcome of an evaluation.
#[derive(Debug, Clone, Default)]
pub struct Decision {
    pub allow: bool,
    /// Policy holding the deciding statement.
    pub policy_id: Option<u64>,
    pub data: Option<Arc<StatementData>>,
}

struct CompiledStatement {
    effect: bool,
    action: Vec<String>,
    resource: Vec<String>,
    condition: Compiled,
    data: Option<Arc<StatementData>>,
}

/// A policy with its conditions built and ready to evaluate.
pub struct CompiledPolicy {
    policy: Arc<Policy>,
    statements: Vec<CompiledStatement>,
}

impl CompiledPolicy {
    /// Checks the document and builds its conditions. Statements must name at
    /// least one action; unregistered condition names are accepted (and the
    /// statement never matches) but a malformed spec is an error.
    pub fn compile(policy: Policy, registry: &ConditionRegistry) -> Result<Self, Error> {
        let mut statements = Vec::with_capacity(policy.statement.len());
        for (i, st) in policy.statement.iter().enumerate() {
            if st.action.iter().all(|a| a.is_empty()) {
                return Err(Error::Policy(format!("policy {} statement {i}: no action", policy.policy_id)));
            }
            let condition = registry
                .compile(&st.conditions)
                .map_err(|e| Error::Policy(format!("policy {} statement {i}: {e}", policy.policy_id)))?;
            if let Compiled::Unknown(name) = &condition {
                warn!(policy = policy.policy_id, statement = i, "unknown condition `{name}`, statement is inert");
            }
            statements.push(CompiledStatement {
                effect: st.effect,
                action: st.action.clone(),
                resource: st.resource.clone(),
                condition,
                data: (!st.data.is_empty()).then(|| Arc::new(st.data.clone())),
            });
        }
        Ok(Self { policy: Arc::new(policy), statements })
    }

    pub fn policy(&self) -> &Arc<Policy> {
        &self.policy
    }

    /// The first matching statement's decision, if any.
    fn decide(&self, action: &str, resource: &str, ctx: &Context) -> Option<Decision> {
        for (i, st) in self.statements.iter().enumerate() {
            if !st.action.iter().any(|g| glob_match(g, action)) {
                continue;
            }
            if !st.resource.is_empty() && !st.resource.iter().any(|g| glob_match(g, resource)) {
                continue;
            }
            match &st.condition {
                Compiled::Ready(cond) if cond(ctx) => {}
                Compiled::Ready(_) => continue,
                Compiled::Unknown(name) => {
                    ctx.warning(format_args!(
                        "policy {} statement {i} skipped: unknown condition `{name}`",
                        self.policy.policy_id
                    ));
                    continue;
                }
            }
            return Some(Decision { allow: st.effect, policy_id: Some(self.policy.policy_id), data: st.data.clone() });
        }
        None
    }
}

#[derive(Default, Clone)]
struct Snapshot {
    policies: HashMap<u64, Arc<CompiledPolicy>>,
    /// Per user, ordered by `index` with ties in insertion order.
    members: HashMap<u64, Vec<Member>>,
    guests: Vec<u64>,
}

/// Policies and members behind an atomically swapped snapshot.
pub struct PolicyStore {
    snapshot: ArcSwap<Snapshot>,
    writer: Mutex<()>,
    conditions: ConditionRegistry,
}

impl PolicyStore {
    /// A store using a copy of the process-wide condition registry.
    pub fn new() -> Self {
        Self::with_conditions(ConditionRegistry::global())
    }

    pub fn with_conditions(conditions: ConditionRegistry) -> Self {
        Self { snapshot: ArcSwap::from_pointee(Snapshot::default()), writer: Mutex::new(()), conditions }
    }

    pub fn conditions(&self) -> &ConditionRegistry {
        &self.conditions
    }

    /// Clones the current snapshot, applies `f` and publishes the result.
    fn update<R>(&self, f: impl FnOnce(&mut Snapshot) -> R) -> R {
        let _guard = self.writer.lock();
        let mut next = Snapshot::clone(&self.snapshot.load());
        let out = f(&mut next);
        self.snapshot.store(Arc::new(next));
        out
    }

    /// Validates and stores `policy`, replacing any with the same id. Id 0 is
    /// reserved for inline bearer policies.
    pub fn set_policy(&self, policy: Policy) -> Result<Arc<Policy>, Error> {
        if policy.policy_id == 0 {
            return Err(Error::Policy("policy_id 0 is reserved".into()));
        }
        let compiled = Arc::new(CompiledPolicy::compile(policy, &self.conditions)?);
        let stored = Arc::clone(&compiled.policy);
        self.update(|s| s.policies.insert(stored.policy_id, compiled));
        Ok(stored)
    }

    /// Removes a policy and every membership pointing at it.
    pub fn remove_policy(&self, policy_id: u64) -> bool {
        self.update(|s| {
            let removed = s.policies.remove(&policy_id).is_some();
            for list in s.members.values_mut() {
                list.retain(|m| m.policy_id != policy_id);
            }
            s.members.retain(|_, list| !list.is_empty());
            removed
        })
    }

    pub fn policy(&self, policy_id: u64) -> Option<Arc<Policy>> {
        self.snapshot.load().policies.get(&policy_id).map(|p| Arc::clone(&p.policy))
    }

    /// All policies ordered by id.
    pub fn policies(&self) -> Vec<Arc<Policy>> {
        let snapshot = self.snapshot.load();
        let mut all: Vec<_> = snapshot.policies.values().map(|p| Arc::clone(&p.policy)).collect();
        all.sort_by_key(|p| p.policy_id);
        all
    }

    /// Binds a user to an existing policy. Re-adding the same pair replaces
    /// the old binding.
    pub fn add_member(&self, member: Member) -> Result<(), Error> {
        if member.user_id == 0 {
            return Err(Error::Policy("user_id 0 is the guest identity".into()));
        }
        self.update(|s| {
            if !s.policies.contains_key(&member.policy_id) {
                return Err(Error::Policy(format!("no policy {}", member.policy_id)));
            }
            let list = s.members.entry(member.user_id).or_default();
            list.retain(|m| m.policy_id != member.policy_id);
            let at = list.partition_point(|m| m.index <= member.index);
            list.insert(at, member);
            Ok(())
        })
    }

    pub fn remove_member(&self, user_id: u64, policy_id: u64) -> bool {
        self.update(|s| {
            let Some(list) = s.members.get_mut(&user_id) else {
                return false;
            };
            let before = list.len();
            list.retain(|m| m.policy_id != policy_id);
            let removed = list.len() != before;
            if list.is_empty() {
                s.members.remove(&user_id);
            }
            removed
        })
    }

    /// A user's bindings in evaluation order, expired ones included.
    pub fn members(&self, user_id: u64) -> Vec<Member> {
        self.snapshot.load().members.get(&user_id).cloned().unwrap_or_default()
    }

    /// Policies evaluated for requests without a user.
    pub fn set_guest_policies(&self, ids: Vec<u64>) {
        self.update(|s| s.guests = ids);
    }

    pub fn guest_policies(&self) -> Vec<u64> {
        self.snapshot.load().guests.clone()
    }

    /// Decides for `user` (0 is the guest).
    pub fn evaluate(&self, user: u64, action: &str, resource: &str, ctx: &Context) -> Decision {
        self.evaluate_with(user, None, action, resource, ctx)
    }

    /// Like [`evaluate`](Self::evaluate), trying `inline` before the user's
    /// stored policies.
    pub fn evaluate_with(
        &self,
        user: u64,
        inline: Option<&CompiledPolicy>,
        action: &str,
        resource: &str,
        ctx: &Context,
    ) -> Decision {
        if let Some(decision) = inline.and_then(|p| p.decide(action, resource, ctx)) {
            return decision;
        }
        let snapshot = self.snapshot.load();
        let ids: Vec<u64> = if user == 0 {
            snapshot.guests.clone()
        } else {
            let now = chrono::Utc::now().timestamp();
            snapshot
                .members
                .get(&user)
                .map(|list| list.iter().filter(|m| !m.is_expired(now)).map(|m| m.policy_id).collect())
                .unwrap_or_default()
        };
        ids.iter()
            .filter_map(|id| snapshot.policies.get(id))
            .find_map(|p| p.decide(action, resource, ctx))
            .unwrap_or_default()
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;

    use crate::context::tests::context_for;

    fn ctx(method: &str, ip: &str) -> Context {
        let req = http::Request::builder()
            .method(method)
            .uri("/doc/42")
            .header("x-real-ip", ip)
            .body(Bytes::new())
            .unwrap();
        context_for(req).0
    }

    fn policy(id: u64, statements: Value) -> Policy {
        serde_json::from_value(json!({"policy_id": id, "name": format!("p{id}"), "statement": statements})).unwrap()
    }

    fn reader_store() -> PolicyStore {
        let store = PolicyStore::new();
        store
            .set_policy(policy(
                1,
                json!([{
                    "effect": true,
                    "action": ["read:*"],
                    "resource": ["doc/*"],
                    "conditions": {"method": ["GET"], "sourceip": ["10.0.0.0/8"]},
                    "data": {"fields": ["title"]}
                }]),
            ))
            .unwrap();
        store.add_member(Member { user_id: 1, policy_id: 1, index: 0, expiration: 0 }).unwrap();
        store
    }

    #[test]
    fn allow_needs_every_part_to_match() {
        let store = reader_store();
        let d = store.evaluate(1, "read:doc", "doc/42", &ctx("GET", "10.1.2.3"));
        assert!(d.allow);
        assert_eq!(d.policy_id, Some(1));
        assert_eq!(d.data.unwrap()["fields"], vec![json!("title")]);

        assert!(!store.evaluate(1, "read:doc", "doc/42", &ctx("GET", "192.168.1.1")).allow);
        assert!(!store.evaluate(1, "write:doc", "doc/42", &ctx("GET", "10.1.2.3")).allow);
        assert!(!store.evaluate(1, "read:doc", "img/1", &ctx("GET", "10.1.2.3")).allow);
        assert!(!store.evaluate(2, "read:doc", "doc/42", &ctx("GET", "10.1.2.3")).allow);
    }

    #[test]
    fn first_matching_deny_wins() {
        let store = PolicyStore::new();
        store
            .set_policy(policy(
                1,
                json!([
                    {"effect": false, "action": ["*"], "resource": ["doc/secret"]},
                    {"effect": true, "action": ["*"]}
                ]),
            ))
            .unwrap();
        store.set_policy(policy(2, json!([{"effect": true, "action": ["*"]}]))).unwrap();
        store.add_member(Member { user_id: 5, policy_id: 2, index: 1, expiration: 0 }).unwrap();
        store.add_member(Member { user_id: 5, policy_id: 1, index: 0, expiration: 0 }).unwrap();

        let c = ctx("GET", "1.1.1.1");
        assert!(!store.evaluate(5, "read", "doc/secret", &c).allow);
        assert!(store.evaluate(5, "read", "doc/open", &c).allow);
    }

    #[test]
    fn ties_keep_insertion_order_and_expired_members_are_skipped() {
        let store = PolicyStore::new();
        store.set_policy(policy(1, json!([{"effect": false, "action": ["*"]}]))).unwrap();
        store.set_policy(policy(2, json!([{"effect": true, "action": ["*"]}]))).unwrap();
        store.add_member(Member { user_id: 9, policy_id: 2, index: 3, expiration: 0 }).unwrap();
        store.add_member(Member { user_id: 9, policy_id: 1, index: 3, expiration: 0 }).unwrap();
        let order: Vec<u64> = store.members(9).iter().map(|m| m.policy_id).collect();
        assert_eq!(order, [2, 1]);
        let c = ctx("GET", "1.1.1.1");
        assert!(store.evaluate(9, "x", "y", &c).allow);

        store.add_member(Member { user_id: 9, policy_id: 2, index: 3, expiration: 1 }).unwrap();
        assert!(!store.evaluate(9, "x", "y", &c).allow);
    }

    #[test]
    fn guests_use_the_guest_list() {
        let store = PolicyStore::new();
        store.set_policy(policy(3, json!([{"effect": true, "action": ["read:public"]}]))).unwrap();
        let c = ctx("GET", "1.1.1.1");
        assert!(!store.evaluate(0, "read:public", "/", &c).allow);
        store.set_guest_policies(vec![3]);
        assert!(store.evaluate(0, "read:public", "/", &c).allow);
    }

    #[test]
    fn unknown_conditions_make_a_statement_inert() {
        let store = PolicyStore::new();
        store
            .set_policy(policy(
                1,
                json!([
                    {"effect": true, "action": ["*"], "conditions": {"moonphase": "full"}},
                    {"effect": false, "action": ["*"]}
                ]),
            ))
            .unwrap();
        store.add_member(Member { user_id: 1, policy_id: 1, index: 0, expiration: 0 }).unwrap();
        let d = store.evaluate(1, "a", "b", &ctx("GET", "1.1.1.1"));
        assert!(!d.allow);
        assert_eq!(d.policy_id, Some(1));
    }

    #[test]
    fn writes_are_validated() {
        let store = PolicyStore::new();
        assert!(store.set_policy(policy(0, json!([]))).is_err());
        assert!(store.set_policy(policy(1, json!([{"effect": true, "action": []}]))).is_err());
        assert!(store.set_policy(policy(1, json!([{"effect": true, "action": ["*"], "conditions": {"sourceip": ["x"]}}]))).is_err());
        assert!(store.add_member(Member { user_id: 1, policy_id: 9, index: 0, expiration: 0 }).is_err());
    }

    #[test]
    fn removing_a_policy_drops_its_members() {
        let store = reader_store();
        assert!(store.remove_policy(1));
        assert!(store.members(1).is_empty());
        assert!(!store.remove_policy(1));
        assert!(store.policies().is_empty());
    }
}
