//! plans and state snapshots, as far as evaluation needs them
//!
//! These are read-only inputs: producing plans and persisting state is done elsewhere.
use crate::addrs::{AbsResourceInstance, AbsResourceInstanceObject, DeposedKey};
use indexmap::IndexMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    NoOp,
    Create,
    Read,
    Update,
    Delete,
    Replace,
}

/// A planned action for one resource instance object
#[derive(Debug, Clone, PartialEq, derive_new::new)]
pub struct ResourceInstanceChange {
    pub addr: AbsResourceInstance,
    pub deposed: Option<DeposedKey>,
    pub action: ChangeAction,
}

impl ResourceInstanceChange {
    /// The object this change applies to
    pub fn object_addr(&self) -> AbsResourceInstanceObject {
        AbsResourceInstanceObject::new(self.addr.clone(), self.deposed.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changes {
    pub resources: Vec<ResourceInstanceChange>,
}

/// Persisted attributes of one object
#[derive(Debug, Clone, Default, PartialEq, derive_new::new)]
pub struct ObjectState {
    pub attributes: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceInstanceState {
    pub current: Option<ObjectState>,
    pub deposed: IndexMap<DeposedKey, ObjectState>,
}

impl ResourceInstanceState {
    fn is_empty(&self) -> bool {
        self.current.is_none() && self.deposed.is_empty()
    }
}

/// A snapshot of every resource instance object
#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    resources: IndexMap<AbsResourceInstance, ResourceInstanceState>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_current(&mut self, addr: AbsResourceInstance, object: ObjectState) {
        self.resources.entry(addr).or_default().current = Some(object);
    }

    pub fn set_deposed(&mut self, addr: AbsResourceInstance, key: DeposedKey, object: ObjectState) {
        self.resources
            .entry(addr)
            .or_default()
            .deposed
            .insert(key, object);
    }

    /// Forgets an object, returning what was stored for it
    pub fn remove_object(&mut self, addr: &AbsResourceInstanceObject) -> Option<ObjectState> {
        let instance = self.resources.get_mut(&addr.resource_instance)?;
        let removed = match &addr.deposed {
            None => instance.current.take(),
            Some(key) => instance.deposed.shift_remove(key),
        };
        if instance.is_empty() {
            self.resources.shift_remove(&addr.resource_instance);
        }
        removed
    }

    pub fn object(&self, addr: &AbsResourceInstanceObject) -> Option<&ObjectState> {
        let instance = self.resources.get(&addr.resource_instance)?;
        match &addr.deposed {
            None => instance.current.as_ref(),
            Some(key) => instance.deposed.get(key),
        }
    }

    /// Addresses of every current and deposed object in the snapshot
    pub fn all_resource_instance_object_addrs(&self) -> Vec<AbsResourceInstanceObject> {
        let mut addrs = vec![];
        for (addr, instance) in &self.resources {
            if instance.current.is_some() {
                addrs.push(addr.current_object());
            }
            for key in instance.deposed.keys() {
                addrs.push(addr.deposed_object(key.clone()));
            }
        }
        addrs
    }
}

/// What a plan operation produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub changes: Option<Changes>,
    /// State after refresh, before any change
    pub prior_state: Option<State>,
    /// State as the previous run left it
    pub prev_run_state: Option<State>,
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::addrs::{InstanceKey, ResourceAddr};
    use pretty_assertions::assert_eq;

    pub(crate) fn instance(resource_type: &str, name: &str) -> AbsResourceInstance {
        AbsResourceInstance::new(
            ResourceAddr::new(resource_type.into(), name.into()),
            InstanceKey::NoKey,
        )
    }

    #[test]
    fn object_addrs_include_deposed() {
        let web = instance("test_instance", "web");
        let mut state = State::new();
        state.set_current(web.clone(), ObjectState::new(serde_json::json!({"id": "a"})));
        state.set_deposed(
            web.clone(),
            DeposedKey("00000001".into()),
            ObjectState::new(serde_json::json!({"id": "b"})),
        );

        assert_eq!(
            state.all_resource_instance_object_addrs(),
            vec![
                web.current_object(),
                web.deposed_object(DeposedKey("00000001".into()))
            ]
        );
    }

    #[test]
    fn removing_the_last_object_forgets_the_instance() {
        let web = instance("test_instance", "web");
        let mut state = State::new();
        state.set_current(web.clone(), ObjectState::default());

        assert!(state.remove_object(&web.current_object()).is_some());
        assert!(state.object(&web.current_object()).is_none());
        assert_eq!(state, State::new());
    }

    #[test]
    fn change_object_addr() {
        let web = instance("test_instance", "web");
        let change = ResourceInstanceChange::new(
            web.clone(),
            Some(DeposedKey("k".into())),
            ChangeAction::Delete,
        );
        assert_eq!(
            change.object_addr(),
            web.deposed_object(DeposedKey("k".into()))
        );
    }
}
