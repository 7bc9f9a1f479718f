//! Access policy registration.
//!
//! Domains declare the actor roles they know about and named boolean
//! conditions over a command's tenant, user and payload. Nothing here enforces
//! access; saga plan contexts evaluate conditions by name.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use strata_core::{TenantId, UserId};

/// What a condition is evaluated against.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionInput {
    pub tenant_id: TenantId,
    pub user_id: Option<UserId>,
    pub payload: JsonValue,
}

pub type Condition = Arc<dyn Fn(&ConditionInput) -> bool + Send + Sync>;

/// Roles and named conditions declared by one domain.
#[derive(Clone, Default)]
pub struct AccessModel {
    domain: String,
    roles: Vec<String>,
    conditions: BTreeMap<String, Condition>,
}

impl fmt::Debug for AccessModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessModel")
            .field("domain", &self.domain)
            .field("roles", &self.roles)
            .field("conditions", &self.conditions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AccessModel {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        let role = role.into();
        if !self.roles.contains(&role) {
            self.roles.push(role);
        }
        self
    }

    pub fn with_condition(
        mut self,
        name: impl Into<String>,
        condition: impl Fn(&ConditionInput) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.conditions.insert(name.into(), Arc::new(condition));
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    pub fn condition_names(&self) -> impl Iterator<Item = &str> {
        self.conditions.keys().map(String::as_str)
    }

    pub(crate) fn split(self) -> (String, Vec<String>, BTreeMap<String, Condition>) {
        (self.domain, self.roles, self.conditions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roles_are_deduplicated() {
        let model = AccessModel::new("orders")
            .with_role("clerk")
            .with_role("manager")
            .with_role("clerk");
        assert_eq!(model.roles(), &["clerk".to_string(), "manager".to_string()]);
    }

    #[test]
    fn conditions_are_named() {
        let model = AccessModel::new("orders")
            .with_condition("isLarge", |input| input.payload["amount"].as_i64() > Some(100));
        assert_eq!(model.condition_names().collect::<Vec<_>>(), vec!["isLarge"]);

        let (_, _, mut conditions) = model.split();
        let condition = conditions.remove("isLarge").unwrap();
        let input = ConditionInput {
            tenant_id: TenantId::from("t1"),
            user_id: None,
            payload: json!({ "amount": 500 }),
        };
        assert!(condition(&input));
    }
}
