//! Environment scoping: a process-wide active environment slot plus a thin
//! registry mapping environment names to the classes and parameters active
//! in them. [`with_env`] installs an environment for the duration of a
//! closure and restores the previous one on every exit path, including
//! panics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use tracing::debug;

use crate::construct::{ObjectClass, OtherHasher, Parameter, RelationshipClass};

pub const BASE_ENV: &str = "base";

#[derive(Debug, Default)]
struct Scope {
    object_classes: Vec<Arc<ObjectClass>>,
    relationship_classes: Vec<Arc<RelationshipClass>>,
    parameters: Vec<Arc<Parameter>>,
}

lazy_static! {
    static ref ACTIVE: Mutex<String> = Mutex::new(String::from(BASE_ENV));
    static ref REGISTRY: Mutex<HashMap<String, Scope, OtherHasher>> =
        Mutex::new(HashMap::default());
}

pub fn active_env() -> String {
    ACTIVE.lock().unwrap().clone()
}

/// Runs `f` with `env` installed as the active environment, restoring the
/// prior one afterwards. The restore happens in a drop guard so a panicking
/// `f` cannot leak the environment.
pub fn with_env<R>(env: &str, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<String>);
    impl Drop for Restore {
        fn drop(&mut self) {
            if let Some(previous) = self.0.take() {
                if let Ok(mut guard) = ACTIVE.lock() {
                    *guard = previous;
                }
            }
        }
    }
    let previous = {
        let mut guard = ACTIVE.lock().unwrap();
        std::mem::replace(&mut *guard, env.to_string())
    };
    let _restore = Restore(Some(previous));
    f()
}

/// Registers a class in `env` (the active one when `None`). Returns whether
/// the class was newly added; an existing class of the same name wins.
pub fn register_object_class(class: &Arc<ObjectClass>, env: Option<&str>) -> bool {
    let env = env.map(str::to_string).unwrap_or_else(active_env);
    let mut registry = REGISTRY.lock().unwrap();
    let scope = registry.entry(env.clone()).or_default();
    if scope.object_classes.iter().any(|c| c.name() == class.name()) {
        return false;
    }
    class.add_env(&env);
    scope.object_classes.push(Arc::clone(class));
    debug!(env, class = class.name(), "object class registered");
    true
}

pub fn register_relationship_class(class: &Arc<RelationshipClass>, env: Option<&str>) -> bool {
    let env = env.map(str::to_string).unwrap_or_else(active_env);
    let mut registry = REGISTRY.lock().unwrap();
    let scope = registry.entry(env.clone()).or_default();
    if scope
        .relationship_classes
        .iter()
        .any(|c| c.name() == class.name())
    {
        return false;
    }
    class.add_env(&env);
    scope.relationship_classes.push(Arc::clone(class));
    debug!(env, class = class.name(), "relationship class registered");
    true
}

pub fn register_parameter(parameter: &Arc<Parameter>, env: Option<&str>) -> bool {
    let env = env.map(str::to_string).unwrap_or_else(active_env);
    let mut registry = REGISTRY.lock().unwrap();
    let scope = registry.entry(env.clone()).or_default();
    if scope.parameters.iter().any(|p| p.name() == parameter.name()) {
        return false;
    }
    parameter.add_env(&env);
    scope.parameters.push(Arc::clone(parameter));
    debug!(env, parameter = parameter.name(), "parameter registered");
    true
}

pub fn object_classes(env: Option<&str>) -> Vec<Arc<ObjectClass>> {
    let env = env.map(str::to_string).unwrap_or_else(active_env);
    REGISTRY
        .lock()
        .unwrap()
        .get(&env)
        .map(|scope| scope.object_classes.clone())
        .unwrap_or_default()
}

pub fn relationship_classes(env: Option<&str>) -> Vec<Arc<RelationshipClass>> {
    let env = env.map(str::to_string).unwrap_or_else(active_env);
    REGISTRY
        .lock()
        .unwrap()
        .get(&env)
        .map(|scope| scope.relationship_classes.clone())
        .unwrap_or_default()
}

pub fn parameters(env: Option<&str>) -> Vec<Arc<Parameter>> {
    let env = env.map(str::to_string).unwrap_or_else(active_env);
    REGISTRY
        .lock()
        .unwrap()
        .get(&env)
        .map(|scope| scope.parameters.clone())
        .unwrap_or_default()
}

/// The object class named `name`, iff active in `env`.
pub fn object_class(name: &str, env: Option<&str>) -> Option<Arc<ObjectClass>> {
    object_classes(env).into_iter().find(|c| c.name() == name)
}

pub fn relationship_class(name: &str, env: Option<&str>) -> Option<Arc<RelationshipClass>> {
    relationship_classes(env).into_iter().find(|c| c.name() == name)
}

pub fn parameter(name: &str, env: Option<&str>) -> Option<Arc<Parameter>> {
    parameters(env).into_iter().find(|p| p.name() == name)
}

fn missing_names(left: Vec<String>, right: Vec<String>) -> Vec<String> {
    left.into_iter().filter(|n| !right.contains(n)).collect()
}

/// A printable summary of the class and parameter names present in `left`
/// but not in `right`.
pub fn difference(left: &str, right: &str) -> String {
    let object_names = missing_names(
        object_classes(Some(left)).iter().map(|c| c.name().to_string()).collect(),
        object_classes(Some(right)).iter().map(|c| c.name().to_string()).collect(),
    );
    let relationship_names = missing_names(
        relationship_classes(Some(left)).iter().map(|c| c.name().to_string()).collect(),
        relationship_classes(Some(right)).iter().map(|c| c.name().to_string()).collect(),
    );
    let parameter_names = missing_names(
        parameters(Some(left)).iter().map(|p| p.name().to_string()).collect(),
        parameters(Some(right)).iter().map(|p| p.name().to_string()).collect(),
    );
    let render = |names: Vec<String>| {
        if names.is_empty() {
            String::from("  (none)")
        } else {
            format!("  {}", names.join(", "))
        }
    };
    format!(
        "object classes in {left} but not in {right}:\n{}\n\
         relationship classes in {left} but not in {right}:\n{}\n\
         parameters in {left} but not in {right}:\n{}",
        render(object_names),
        render(relationship_names),
        render(parameter_names),
    )
}
