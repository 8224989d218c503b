//! Permission statements, managed policy references and the policy assembler.
//!
//! An [`Identity`] carries an ordered list of inline statements plus a set of
//! managed policy bundles. The [`PolicyAssembler`] is the only way statements
//! get attached, so every statement on a built identity has been validated.
//! Order is kept for rendering and auditing only; evaluation is deny-overrides-allow.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::resource::Identity;
use crate::{Error, Result};

/// IAM policy language version.
pub const POLICY_VERSION: &str = "2012-10-17";

/// Statement effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

impl std::fmt::Display for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Effect::Allow => write!(f, "Allow"),
            Effect::Deny => write!(f, "Deny"),
        }
    }
}

/// One allow/deny rule scoping a set of actions to a set of resource patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionStatement {
    pub sid: Option<String>,
    pub effect: Effect,
    /// Actions in declaration order, without duplicates.
    pub actions: Vec<String>,
    /// ARN patterns in declaration order, without duplicates.
    pub resources: Vec<String>,
}

impl PermissionStatement {
    pub fn allow() -> Self {
        Self::new(Effect::Allow)
    }

    pub fn deny() -> Self {
        Self::new(Effect::Deny)
    }

    fn new(effect: Effect) -> Self {
        Self {
            sid: None,
            effect,
            actions: Vec::new(),
            resources: Vec::new(),
        }
    }

    pub fn with_sid(mut self, sid: impl Into<String>) -> Self {
        self.sid = Some(sid.into());
        self
    }

    pub fn with_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for action in actions {
            push_unique(&mut self.actions, action.into());
        }
        self
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for resource in resources {
            push_unique(&mut self.resources, resource.into());
        }
        self
    }

    /// True when any resource pattern contains a wildcard.
    pub fn is_broad_scope(&self) -> bool {
        self.resources.iter().any(|r| r.contains('*'))
    }

    /// Whether this statement names the action on the resource.
    pub fn matches(&self, action: &str, resource: &str) -> bool {
        let action = action.to_ascii_lowercase();
        self.actions
            .iter()
            .any(|a| glob_match(&a.to_ascii_lowercase(), &action))
            && self.resources.iter().any(|r| glob_match(r, resource))
    }

    fn validate(&self, identity: &str) -> Result<()> {
        let label = self.sid.as_deref().unwrap_or("<unnamed>");
        if self.actions.is_empty() {
            return Err(Error::InvalidStatement {
                identity: identity.to_string(),
                message: format!("statement {} has an empty action set", label),
            });
        }
        if self.resources.is_empty() {
            return Err(Error::InvalidStatement {
                identity: identity.to_string(),
                message: format!("statement {} has an empty resource set", label),
            });
        }
        if let Some(bad) = self
            .actions
            .iter()
            .find(|a| a.as_str() != "*" && !a.contains(':'))
        {
            return Err(Error::InvalidStatement {
                identity: identity.to_string(),
                message: format!(
                    "statement {}: action '{}' is not of the form service:Action",
                    label, bad
                ),
            });
        }
        Ok(())
    }
}

/// Reference to a provider-managed policy bundle. Referenced, never owned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManagedPolicyRef {
    pub name: String,
}

impl ManagedPolicyRef {
    pub fn aws_managed(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn arn(&self) -> String {
        format!("arn:aws:iam::aws:policy/{}", self.name)
    }
}

/// Rendered statement, in IAM JSON field naming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementDocument {
    #[serde(rename = "Sid", skip_serializing_if = "Option::is_none", default)]
    pub sid: Option<String>,
    #[serde(rename = "Effect")]
    pub effect: Effect,
    #[serde(rename = "Action")]
    pub action: Vec<String>,
    #[serde(rename = "Resource")]
    pub resource: Vec<String>,
}

/// Inline policy document attached to an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Statement")]
    pub statement: Vec<StatementDocument>,
}

impl PolicyDocument {
    pub fn from_statements(statements: &[PermissionStatement]) -> Self {
        Self {
            version: POLICY_VERSION.to_string(),
            statement: statements
                .iter()
                .map(|s| StatementDocument {
                    sid: s.sid.clone(),
                    effect: s.effect,
                    action: s.actions.clone(),
                    resource: s.resources.clone(),
                })
                .collect(),
        }
    }
}

/// The final grant set of an identity: inline document plus managed bundles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectivePermissions {
    pub document: PolicyDocument,
    pub managed_policy_arns: Vec<String>,
    /// Indices of statements whose resources contain wildcards.
    pub broad_scope_statements: Vec<usize>,
}

impl EffectivePermissions {
    pub fn of(identity: &Identity) -> Self {
        Self {
            document: PolicyDocument::from_statements(&identity.statements),
            managed_policy_arns: identity.managed_policies.iter().map(|p| p.arn()).collect(),
            broad_scope_statements: identity
                .statements
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_broad_scope())
                .map(|(i, _)| i)
                .collect(),
        }
    }
}

/// Evaluate the inline statements of an identity for one request.
///
/// An explicit deny wins over any allow, and without a matching allow the
/// request is denied. Managed bundles are opaque here and never evaluated.
pub fn is_allowed(statements: &[PermissionStatement], action: &str, resource: &str) -> bool {
    let mut allowed = false;
    for statement in statements.iter().filter(|s| s.matches(action, resource)) {
        match statement.effect {
            Effect::Deny => return false,
            Effect::Allow => allowed = true,
        }
    }
    allowed
}

/// Attaches validated statements and managed bundles to an identity.
///
/// Additive only: the identity is rebuilt from its full declared set on every
/// deploy, so there is no remove operation.
#[derive(Debug, Clone)]
pub struct PolicyAssembler {
    identity: Identity,
}

impl PolicyAssembler {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }

    /// Append a statement. Empty action or resource sets and duplicate sids
    /// are rejected here, before anything reaches a deployment.
    pub fn attach(&mut self, statement: PermissionStatement) -> Result<&mut Self> {
        statement.validate(&self.identity.name)?;

        if let Some(sid) = &statement.sid {
            if self
                .identity
                .statements
                .iter()
                .any(|s| s.sid.as_ref() == Some(sid))
            {
                return Err(Error::InvalidStatement {
                    identity: self.identity.name.clone(),
                    message: format!("duplicate statement id '{}'", sid),
                });
            }
        }

        if statement.is_broad_scope() {
            warn!(
                identity = %self.identity.name,
                sid = statement.sid.as_deref().unwrap_or("<unnamed>"),
                resources = ?statement.resources,
                "Statement grants access to wildcard resources"
            );
        }

        self.identity.statements.push(statement);
        Ok(self)
    }

    pub fn attach_managed(&mut self, policy: ManagedPolicyRef) -> &mut Self {
        if !self.identity.managed_policies.contains(&policy) {
            self.identity.managed_policies.push(policy);
        }
        self
    }

    pub fn effective_permissions(&self) -> EffectivePermissions {
        EffectivePermissions::of(&self.identity)
    }

    pub fn finish(self) -> Identity {
        self.identity
    }
}

fn push_unique(values: &mut Vec<String>, value: String) {
    if !values.contains(&value) {
        values.push(value);
    }
}

/// Glob match supporting `*` (any run) and `?` (one char).
fn glob_match(pattern: &str, value: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value.chars().collect();
    let (mut pi, mut vi) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while vi < v.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == v[vi]) {
            pi += 1;
            vi += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, vi));
            pi += 1;
        } else if let Some((star_pi, star_vi)) = star {
            pi = star_pi + 1;
            vi = star_vi + 1;
            star = Some((star_pi, star_vi + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Principal;

    fn identity() -> Identity {
        Identity::builder("AgentRuntimeRole")
            .assumed_by(Principal::service("bedrock-agentcore.amazonaws.com"))
            .build()
    }

    #[test]
    fn test_attach_preserves_order() {
        let mut assembler = PolicyAssembler::new(identity());
        assembler
            .attach(
                PermissionStatement::allow()
                    .with_sid("First")
                    .with_actions(["s3:GetObject"])
                    .with_resources(["arn:aws:s3:::bucket/*"]),
            )
            .unwrap()
            .attach(
                PermissionStatement::allow()
                    .with_sid("Second")
                    .with_actions(["s3:PutObject"])
                    .with_resources(["arn:aws:s3:::bucket/*"]),
            )
            .unwrap();

        let identity = assembler.finish();
        let sids: Vec<_> = identity
            .statements
            .iter()
            .map(|s| s.sid.clone().unwrap())
            .collect();
        assert_eq!(sids, vec!["First", "Second"]);
    }

    #[test]
    fn test_empty_resources_rejected() {
        let mut assembler = PolicyAssembler::new(identity());
        let result = assembler.attach(PermissionStatement::allow().with_actions(["ecr:BatchGetImage"]));
        assert!(matches!(
            result.unwrap_err(),
            Error::InvalidStatement { ref identity, .. } if identity == "AgentRuntimeRole"
        ));
        assert!(assembler.finish().statements.is_empty());
    }

    #[test]
    fn test_empty_actions_rejected() {
        let mut assembler = PolicyAssembler::new(identity());
        let result = assembler.attach(PermissionStatement::allow().with_resources(["*"]));
        assert!(matches!(result, Err(Error::InvalidStatement { .. })));
    }

    #[test]
    fn test_duplicate_sid_rejected() {
        let stmt = PermissionStatement::allow()
            .with_sid("Same")
            .with_actions(["xray:PutTraceSegments"])
            .with_resources(["*"]);

        let mut assembler = PolicyAssembler::new(identity());
        assembler.attach(stmt.clone()).unwrap();
        assert!(matches!(
            assembler.attach(stmt),
            Err(Error::InvalidStatement { .. })
        ));
    }

    #[test]
    fn test_managed_policies_deduplicated() {
        let mut assembler = PolicyAssembler::new(identity());
        assembler
            .attach_managed(ManagedPolicyRef::aws_managed("CloudWatchFullAccess"))
            .attach_managed(ManagedPolicyRef::aws_managed("CloudWatchFullAccess"));

        let perms = assembler.effective_permissions();
        assert_eq!(
            perms.managed_policy_arns,
            vec!["arn:aws:iam::aws:policy/CloudWatchFullAccess"]
        );
    }

    #[test]
    fn test_document_rendering() {
        let mut assembler = PolicyAssembler::new(identity());
        assembler
            .attach(
                PermissionStatement::allow()
                    .with_actions(["xray:PutTraceSegments"])
                    .with_resources(["*"]),
            )
            .unwrap();

        let json = serde_json::to_value(&assembler.effective_permissions().document).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "Version": "2012-10-17",
                "Statement": [{
                    "Effect": "Allow",
                    "Action": ["xray:PutTraceSegments"],
                    "Resource": ["*"]
                }]
            })
        );
        assert_eq!(assembler.effective_permissions().broad_scope_statements, vec![0]);
    }

    #[test]
    fn test_deny_overrides_allow() {
        let statements = vec![
            PermissionStatement::allow()
                .with_actions(["s3:*"])
                .with_resources(["*"]),
            PermissionStatement::deny()
                .with_actions(["s3:DeleteObject"])
                .with_resources(["arn:aws:s3:::prod/*"]),
        ];

        assert!(is_allowed(&statements, "s3:GetObject", "arn:aws:s3:::prod/key"));
        assert!(!is_allowed(&statements, "s3:DeleteObject", "arn:aws:s3:::prod/key"));
        assert!(is_allowed(&statements, "s3:DeleteObject", "arn:aws:s3:::dev/key"));
        assert!(!is_allowed(&statements, "ec2:RunInstances", "*"));
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("arn:aws:ecr:*:repository/*", "arn:aws:ecr:us-east-1:repository/x"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "abbc"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("repository/*", "other/x"));
    }
}
