use regex::Regex;
use serde::{Serialize, Deserialize};
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::process::Command;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Subnet {
    pub subnet_id: String,
    #[serde(default)]
    pub vpc_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SecurityGroup {
    pub group_id: String,
    #[serde(default)]
    pub vpc_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSubnetsOutput { #[serde(default)] subnets: Vec<Subnet> }

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSecurityGroupsOutput { #[serde(default)] security_groups: Vec<SecurityGroup> }

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("aws cli not found in PATH: {0}")]
    CliNotFound(#[from] which::Error),
    #[error("spawn aws {operation}: {source}")]
    Spawn { operation: &'static str, #[source] source: std::io::Error },
    #[error("An error occurred ({code}) when calling the {operation} operation: {message}")]
    Service { code: String, operation: String, message: String },
    #[error("aws {operation} failed: {stderr}")]
    Command { operation: &'static str, stderr: String },
    #[error("decode aws {operation} output: {source}")]
    Decode { operation: &'static str, #[source] source: serde_json::Error },
}

/// Read-only view of the EC2 network directory.
pub trait NetworkLookup {
    fn lookup_subnets(&self, ids: &[String]) -> Result<Vec<Subnet>, LookupError>;
    fn lookup_security_groups(&self, ids: &[String]) -> Result<Vec<SecurityGroup>, LookupError>;
}

impl<T: NetworkLookup + ?Sized> NetworkLookup for &T {
    fn lookup_subnets(&self, ids: &[String]) -> Result<Vec<Subnet>, LookupError> { (**self).lookup_subnets(ids) }
    fn lookup_security_groups(&self, ids: &[String]) -> Result<Vec<SecurityGroup>, LookupError> { (**self).lookup_security_groups(ids) }
}

/// Transport settings handed to every `aws` invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ec2Options {
    pub region: String,
    pub profile: Option<String>,
    pub max_attempts: Option<u32>,
}

impl Ec2Options {
    pub fn new(region: impl Into<String>) -> Self { Self { region: region.into(), ..Self::default() } }

    pub fn describe_args(&self, subcommand: &str, id_flag: &str, ids: &[String]) -> Vec<String> {
        let mut args = vec!["ec2".to_string(), subcommand.to_string(), id_flag.to_string()];
        args.extend(ids.iter().cloned());
        args.extend(["--output".to_string(), "json".to_string()]);
        args.extend(["--region".to_string(), self.region.clone()]);
        if let Some(p) = &self.profile { args.extend(["--profile".to_string(), p.clone()]); }
        args
    }
}

/// `NetworkLookup` backed by the AWS CLI (`aws ec2 describe-*`).
///
/// The `aws` binary is looked up on the first describe call, so a pass that
/// makes no lookups never needs the CLI installed.
#[derive(Debug, Clone)]
pub struct AwsCliEc2 { aws: OnceLock<PathBuf>, opts: Ec2Options }

impl AwsCliEc2 {
    pub fn new(opts: Ec2Options) -> Self { Self { aws: OnceLock::new(), opts } }

    fn aws(&self) -> Result<&PathBuf, LookupError> {
        if let Some(p) = self.aws.get() { return Ok(p); }
        let found = which::which("aws")?;
        Ok(self.aws.get_or_init(|| found))
    }

    fn describe<T: DeserializeOwned>(&self, operation: &'static str, subcommand: &str, id_flag: &str, ids: &[String]) -> Result<T, LookupError> {
        let args = self.opts.describe_args(subcommand, id_flag, ids);
        debug!(operation, region = %self.opts.region, ?ids, "calling aws cli");
        let mut cmd = Command::new(self.aws()?);
        cmd.args(&args);
        if let Some(n) = self.opts.max_attempts { cmd.env("AWS_MAX_ATTEMPTS", n.to_string()); }
        let out = cmd.output().map_err(|source| LookupError::Spawn { operation, source })?;
        if !out.status.success() {
            return Err(command_error(operation, &String::from_utf8_lossy(&out.stderr)));
        }
        serde_json::from_slice(&out.stdout).map_err(|source| LookupError::Decode { operation, source })
    }
}

impl NetworkLookup for AwsCliEc2 {
    fn lookup_subnets(&self, ids: &[String]) -> Result<Vec<Subnet>, LookupError> {
        let out: DescribeSubnetsOutput = self.describe("DescribeSubnets", "describe-subnets", "--subnet-ids", ids)?;
        Ok(out.subnets)
    }

    fn lookup_security_groups(&self, ids: &[String]) -> Result<Vec<SecurityGroup>, LookupError> {
        let out: DescribeSecurityGroupsOutput = self.describe("DescribeSecurityGroups", "describe-security-groups", "--group-ids", ids)?;
        Ok(out.security_groups)
    }
}

fn client_error_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"An error occurred \(([^)]+)\) when calling the (\w+) operation(?: \([^)]*\))?: (.*)")
            .expect("client error pattern")
    })
}

/// Maps CLI stderr to `Service` when it carries an AWS error code, else `Command`.
pub fn command_error(operation: &'static str, stderr: &str) -> LookupError {
    match client_error_pattern().captures(stderr) {
        Some(c) => LookupError::Service {
            code: c[1].to_string(),
            operation: c[2].to_string(),
            message: c[3].trim().to_string(),
        },
        None => LookupError::Command { operation, stderr: stderr.trim().to_string() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<String> { v.iter().map(|s| s.to_string()).collect() }

    #[test]
    fn construction_does_not_need_the_cli() {
        let lookup = AwsCliEc2::new(Ec2Options::new("eu-west-1"));
        assert!(lookup.aws.get().is_none());
        assert_eq!(lookup.opts.region, "eu-west-1");
    }

    #[test]
    fn describe_args_carry_ids_region_and_profile() {
        let mut opts = Ec2Options::new("us-east-1");
        assert_eq!(
            opts.describe_args("describe-subnets", "--subnet-ids", &ids(&["subnet-1", "subnet-2"])),
            ids(&["ec2", "describe-subnets", "--subnet-ids", "subnet-1", "subnet-2", "--output", "json", "--region", "us-east-1"])
        );
        opts.profile = Some("prod".into());
        let args = opts.describe_args("describe-security-groups", "--group-ids", &ids(&["sg-1"]));
        assert_eq!(&args[args.len() - 2..], &ids(&["--profile", "prod"])[..]);
    }

    #[test]
    fn decodes_describe_subnets_output() {
        let out: DescribeSubnetsOutput = serde_json::from_str(r#"{
            "Subnets": [
                { "SubnetId": "subnet-1", "VpcId": "vpc-123", "CidrBlock": "10.0.0.0/24" },
                { "SubnetId": "subnet-2" }
            ]
        }"#).unwrap();
        assert_eq!(out.subnets, vec![
            Subnet { subnet_id: "subnet-1".into(), vpc_id: Some("vpc-123".into()) },
            Subnet { subnet_id: "subnet-2".into(), vpc_id: None },
        ]);
    }

    #[test]
    fn decodes_describe_security_groups_output() {
        let out: DescribeSecurityGroupsOutput = serde_json::from_str(r#"{
            "SecurityGroups": [{ "GroupId": "sg-1", "GroupName": "default", "VpcId": "vpc-123" }]
        }"#).unwrap();
        assert_eq!(out.security_groups[0].group_id, "sg-1");
        assert_eq!(out.security_groups[0].vpc_id.as_deref(), Some("vpc-123"));
    }

    #[test]
    fn parses_service_errors_from_stderr() {
        let stderr = "\nAn error occurred (InvalidSubnetID.Malformed) when calling the DescribeSubnets operation: Invalid id: \"subnet-invalid123\"\n";
        let err = command_error("DescribeSubnets", stderr);
        match &err {
            LookupError::Service { code, operation, message } => {
                assert_eq!(code, "InvalidSubnetID.Malformed");
                assert_eq!(operation, "DescribeSubnets");
                assert_eq!(message, "Invalid id: \"subnet-invalid123\"");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            err.to_string(),
            "An error occurred (InvalidSubnetID.Malformed) when calling the DescribeSubnets operation: Invalid id: \"subnet-invalid123\""
        );
    }

    #[test]
    fn parses_service_errors_after_retries() {
        let stderr = "An error occurred (RequestLimitExceeded) when calling the DescribeSecurityGroups operation (reached max retries: 2): Request limit exceeded.";
        let err = command_error("DescribeSecurityGroups", stderr);
        assert!(matches!(err, LookupError::Service { ref code, .. } if code == "RequestLimitExceeded"));
    }

    #[test]
    fn other_failures_keep_stderr() {
        let err = command_error("DescribeSubnets", "Unable to locate credentials. You can configure credentials by running \"aws configure\".\n");
        assert!(matches!(err, LookupError::Command { operation: "DescribeSubnets", .. }));
        assert!(err.to_string().starts_with("aws DescribeSubnets failed: Unable to locate credentials"));
    }
}
