use rdsguard_aws::NetworkLookup;
use rdsguard_core::ProxyConfig;
use rdsguard_tfcompat::{string_list, Plan, ResourceChange};
use std::collections::BTreeSet;
use tracing::{info, info_span, warn};

pub const DB_PROXY_TYPE: &str = "aws_db_proxy";

/// Pre-apply checks for the networking of newly created RDS proxies.
///
/// Findings accumulate in order of detection; a validator runs one pass for one caller.
pub struct ProxyPlanValidator<'a, L> {
    plan: &'a Plan,
    config: &'a ProxyConfig,
    lookup: L,
    errors: Vec<String>,
}

impl<'a, L: NetworkLookup> ProxyPlanValidator<'a, L> {
    pub fn new(plan: &'a Plan, config: &'a ProxyConfig, lookup: L) -> Self {
        Self { plan, config, lookup, errors: Vec::new() }
    }

    pub fn errors(&self) -> &[String] { &self.errors }

    pub fn into_errors(self) -> Vec<String> { self.errors }

    /// `aws_db_proxy` changes that create an instance, in plan order.
    pub fn instance_creations(&self) -> Vec<&'a ResourceChange> {
        self.plan.resource_changes.iter().filter(|c| c.creates(DB_PROXY_TYPE)).collect()
    }

    fn error(&mut self, msg: String) {
        warn!(error = %msg, "plan validation finding");
        self.errors.push(msg);
    }

    /// Returns the VPC the subnets live in, or `None` when it cannot be established.
    pub fn validate_subnets(&mut self, subnet_ids: &[String]) -> Option<String> {
        info!(subnets = ?subnet_ids, "Validating subnets");
        if subnet_ids.is_empty() { return None; }

        let subnets = match self.lookup.lookup_subnets(subnet_ids) {
            Ok(s) => s,
            Err(e) => {
                self.error(format!("Error validating subnets: {e}"));
                return None;
            }
        };

        let found: BTreeSet<&str> = subnets.iter().map(|s| s.subnet_id.as_str()).collect();
        let missing = missing_ids(subnet_ids, &found);
        if !missing.is_empty() {
            self.error(format!("Subnet(s) {missing:?} not found"));
            return None;
        }

        let mut vpc_ids = BTreeSet::new();
        for subnet in &subnets {
            match &subnet.vpc_id {
                Some(vpc) => { vpc_ids.insert(vpc.clone()); }
                None => self.error(format!("VpcId not found for subnet {}", subnet.subnet_id)),
            }
        }
        if vpc_ids.len() > 1 {
            self.error("All subnets must belong to the same VPC".to_string());
        }
        // Best effort with several VPCs: the group check still runs against one of them.
        vpc_ids.into_iter().next()
    }

    pub fn validate_security_groups(&mut self, group_ids: &[String], vpc_id: &str) {
        info!(security_groups = ?group_ids, vpc_id, "Validating security groups");
        if group_ids.is_empty() { return; }

        let groups = match self.lookup.lookup_security_groups(group_ids) {
            Ok(g) => g,
            Err(e) => {
                self.error(format!("Error validating security groups: {e}"));
                return;
            }
        };

        let found: BTreeSet<&str> = groups.iter().map(|g| g.group_id.as_str()).collect();
        let missing = missing_ids(group_ids, &found);
        if !missing.is_empty() {
            self.error(format!("Security group(s) {missing:?} not found"));
            return;
        }

        for sg in &groups {
            if sg.vpc_id.as_deref() != Some(vpc_id) {
                self.error(format!("Security group {} does not belong to the same VPC as the subnets", sg.group_id));
            }
        }
    }

    /// Runs every check; true when no finding was recorded.
    pub fn validate(&mut self) -> bool {
        let _span = info_span!("validate_plan", proxy = %self.config.identifier, region = %self.config.region, engine = %self.config.engine_family).entered();
        for change in self.instance_creations() {
            let Some(after) = change.after() else { continue };
            let subnet_ids = string_list(after, "vpc_subnet_ids");
            let group_ids = string_list(after, "vpc_security_group_ids");
            if let Some(vpc_id) = self.validate_subnets(&subnet_ids) {
                self.validate_security_groups(&group_ids, &vpc_id);
            }
        }
        self.errors.is_empty()
    }
}

fn missing_ids<'s>(requested: &'s [String], found: &BTreeSet<&str>) -> BTreeSet<&'s str> {
    requested.iter().map(String::as_str).filter(|id| !found.contains(id)).collect()
}
