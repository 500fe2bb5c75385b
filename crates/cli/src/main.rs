use anyhow::{Result, Context};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value as Json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::fmt::format::FmtSpan;

use rdsguard_aws::{AwsCliEc2, Ec2Options};
use rdsguard_core::AppInterfaceInput;
use rdsguard_policy::ProxyPlanValidator;
use rdsguard_tfcompat as tfc;

#[derive(Parser, Debug)]
#[command(author, version, about="rdsguard — pre-apply checks for RDS Proxy terraform plans")]
struct Cli {
    /// Input document (JSON, or YAML for .yaml/.yml)
    #[arg(short, long, env="INPUT_FILE", default_value="/inputs/input.json", global = true)]
    input: PathBuf,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, ValueEnum)]
enum Runner { Auto, Terraform, Tofu }

impl Runner {
    fn preferred(self) -> Option<tfc::Runner> {
        match self {
            Runner::Terraform => Some(tfc::Runner::Terraform),
            Runner::Tofu      => Some(tfc::Runner::Tofu),
            Runner::Auto      => None,
        }
    }
}

#[derive(Subcommand, Debug)] enum Cmd {
    /// Validate the input and print it with defaults applied
    CheckInput,
    /// Check the networking of planned RDS proxies against live AWS state
    ValidatePlan {
        /// Plan as JSON (`show -json` output) or a binary plan file
        #[arg(long, env="PLAN_FILE_JSON", default_value="work/plan.json")] plan: PathBuf,
        /// Runner used to export binary plans
        #[arg(long, value_enum, default_value_t=Runner::Auto)] runner: Runner,
        #[arg(long, env="AWS_PROFILE")] aws_profile: Option<String>,
        #[arg(long, env="AWS_MAX_ATTEMPTS", default_value_t=3)] aws_max_attempts: u32,
    },
}

fn read_input(path: &Path) -> Result<AppInterfaceInput> {
    let bytes = std::fs::read(path).with_context(|| format!("read input {}", path.display()))?;
    let raw: Json = match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_slice(&bytes).context("parse input yaml")?,
        _ => serde_json::from_slice(&bytes).context("parse input json")?,
    };
    AppInterfaceInput::validate(raw).context("invalid input")
}

fn validate_plan(input: &AppInterfaceInput, plan_path: &Path, runner: Runner, opts: Ec2Options) -> Result<Vec<String>> {
    let plan = tfc::load_plan(plan_path, runner.preferred())?;
    let lookup = AwsCliEc2::new(opts);
    let mut validator = ProxyPlanValidator::new(&plan, &input.data, lookup);
    validator.validate();
    Ok(validator.into_errors())
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt().json().with_span_events(FmtSpan::CLOSE).with_writer(std::io::stderr).init();
    let cli = Cli::parse();
    let input = read_input(&cli.input)?;

    match cli.cmd {
        Cmd::CheckInput => {
            println!("{}", serde_json::to_string_pretty(&input)?);
            Ok(ExitCode::SUCCESS)
        }
        Cmd::ValidatePlan { plan, runner, aws_profile, aws_max_attempts } => {
            info!(plan = %plan.display(), "Running RDS Proxy terraform plan validation");
            let opts = Ec2Options {
                profile: aws_profile,
                max_attempts: Some(aws_max_attempts),
                ..Ec2Options::new(input.data.region.clone())
            };
            let errors = validate_plan(&input, &plan, runner, opts)?;
            if !errors.is_empty() {
                error!(?errors, "Validation failed");
                return Ok(ExitCode::FAILURE);
            }
            info!("Validation ended successfully");
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INPUT_JSON: &str = r#"{
        "data": {
            "region": "us-east-1",
            "identifier": "app-int-example-01-rds-proxy1",
            "tags": { "app": "rds-proxy-example" },
            "auth": [{ "auth_scheme": "SECRETS", "secret_name": "rds-db-credentials" }],
            "db_instance_identifier": "rds-db-instance-id",
            "vpc_security_group_ids": ["sg-1", "sg-2"],
            "vpc_subnet_ids": ["subnet-1", "subnet-2", "subnet-3"]
        },
        "provision": {
            "provision_provider": "aws",
            "provisioner": "app-int-example-01",
            "provider": "rds-proxy",
            "identifier": "app-int-example-01-rds-proxy1",
            "target_cluster": "appint-ex-01",
            "target_namespace": "example-rds-01",
            "target_secret_name": "creds-rds-proxy1",
            "module_provision_data": {
                "tf_state_bucket": "external-resources-terraform-state-dev",
                "tf_state_region": "us-east-1",
                "tf_state_dynamodb_table": "external-resources-terraform-lock",
                "tf_state_key": "aws/app-int-example-01/rds-proxy/app-int-example-01-rds-proxy1/terraform.tfstate"
            }
        }
    }"#;

    #[test]
    fn reads_json_input_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.json");
        std::fs::write(&path, INPUT_JSON).unwrap();
        let input = read_input(&path).unwrap();
        assert_eq!(input.data.auth[0].iam_auth.as_deref(), Some("DISABLED"));
        assert_eq!(input.provision.provider, "rds-proxy");
    }

    #[test]
    fn reads_yaml_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.yaml");
        let raw: Json = serde_json::from_str(INPUT_JSON).unwrap();
        std::fs::write(&path, serde_yaml::to_string(&raw).unwrap()).unwrap();
        let input = read_input(&path).unwrap();
        assert_eq!(input.data.vpc_subnet_ids.len(), 3);
    }

    #[test]
    fn schema_errors_fail_input_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.json");
        std::fs::write(&path, INPUT_JSON.replace(r#", "secret_name": "rds-db-credentials""#, "")).unwrap();
        let err = read_input(&path).unwrap_err();
        assert!(format!("{err:#}").contains("secret_name must be set when auth_scheme is SECRETS"));
    }

    #[test]
    fn plan_without_proxy_creations_needs_no_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("input.json");
        std::fs::write(&input_path, INPUT_JSON).unwrap();
        let plan_path = dir.path().join("plan.json");
        std::fs::write(&plan_path, r#"{
            "resource_changes": [
                { "type": "aws_iam_role", "change": { "actions": ["create"], "after": {} } }
            ]
        }"#).unwrap();
        let input = read_input(&input_path).unwrap();
        let opts = Ec2Options {
            max_attempts: Some(1),
            ..Ec2Options::new(input.data.region.clone())
        };
        let errors = validate_plan(&input, &plan_path, Runner::Auto, opts).unwrap();
        assert!(errors.is_empty());
    }

    #[test]
    fn parses_validate_plan_flags() {
        let cli = Cli::try_parse_from([
            "rdsguard", "--input", "in.json", "validate-plan",
            "--plan", "out/plan.tfplan", "--runner", "tofu", "--aws-max-attempts", "5",
        ]).unwrap();
        assert_eq!(cli.input, PathBuf::from("in.json"));
        match cli.cmd {
            Cmd::ValidatePlan { plan, runner, aws_max_attempts, .. } => {
                assert_eq!(plan, PathBuf::from("out/plan.tfplan"));
                assert_eq!(runner.preferred(), Some(tfc::Runner::Tofu));
                assert_eq!(aws_max_attempts, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
