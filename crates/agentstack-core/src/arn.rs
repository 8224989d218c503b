//! ARNs and the account/region environment that scopes them.

use derive_more::Display;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::{Error, Result};

static ARN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^arn:([a-z][a-z0-9-]*):([a-z0-9-]+):([a-z0-9*-]*):([0-9*]{12}|\*|aws|):(.+)$")
        .expect("ARN regex is valid")
});

static ACCOUNT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{12}$").expect("account regex is valid"));

static REGION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z]{2}(-gov)?-[a-z]+-[0-9]$").expect("region regex is valid")
});

/// A parsed Amazon Resource Name.
///
/// Format: `arn:<partition>:<service>:<region>:<account>:<resource-path>`.
/// Region and account may be empty (global services) or `*` (patterns).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("arn:{partition}:{service}:{region}:{account}:{resource}")]
pub struct Arn {
    pub partition: String,
    pub service: String,
    pub region: String,
    pub account: String,
    pub resource: String,
}

impl Arn {
    /// Whether this ARN contains a wildcard anywhere outside the partition.
    pub fn is_pattern(&self) -> bool {
        self.region.contains('*') || self.account.contains('*') || self.resource.contains('*')
    }
}

impl std::str::FromStr for Arn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let caps = ARN_REGEX
            .captures(s)
            .ok_or_else(|| Error::InvalidInput(format!("malformed ARN: '{}'", s)))?;

        Ok(Self {
            partition: caps[1].to_string(),
            service: caps[2].to_string(),
            region: caps[3].to_string(),
            account: caps[4].to_string(),
            resource: caps[5].to_string(),
        })
    }
}

/// Target account and region. Every ARN and export is scoped to one environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Environment {
    pub account: String,
    pub region: String,
    pub partition: String,
}

impl Environment {
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Result<Self> {
        let account = account.into();
        let region = region.into();

        if !ACCOUNT_REGEX.is_match(&account) {
            return Err(Error::InvalidInput(format!(
                "account must be 12 digits, got '{}'",
                account
            )));
        }
        if !REGION_REGEX.is_match(&region) {
            return Err(Error::InvalidInput(format!("invalid region '{}'", region)));
        }

        Ok(Self {
            account,
            region,
            partition: "aws".to_string(),
        })
    }

    /// Domain suffix for service endpoints in this partition.
    pub fn url_suffix(&self) -> &'static str {
        match self.partition.as_str() {
            "aws-cn" => "amazonaws.com.cn",
            _ => "amazonaws.com",
        }
    }

    /// ARN scoped to this account and region.
    pub fn arn(&self, service: &str, resource: &str) -> Arn {
        Arn {
            partition: self.partition.clone(),
            service: service.to_string(),
            region: self.region.clone(),
            account: self.account.clone(),
            resource: resource.to_string(),
        }
    }

    /// ARN for account-scoped global services such as IAM.
    pub fn global_arn(&self, service: &str, resource: &str) -> Arn {
        Arn {
            region: String::new(),
            ..self.arn(service, resource)
        }
    }

    pub fn ecr_repository_arn(&self, name: &str) -> Arn {
        self.arn("ecr", &format!("repository/{}", name))
    }

    pub fn ecr_repository_uri(&self, name: &str) -> String {
        format!(
            "{}.dkr.ecr.{}.{}/{}",
            self.account,
            self.region,
            self.url_suffix(),
            name
        )
    }

    pub fn iam_role_arn(&self, role_name: &str) -> Arn {
        self.global_arn("iam", &format!("role/{}", role_name))
    }

    /// Service principal domain, e.g. `bedrock-agentcore.amazonaws.com`.
    pub fn service_principal(&self, service: &str) -> String {
        format!("{}.{}", service, self.url_suffix())
    }
}
