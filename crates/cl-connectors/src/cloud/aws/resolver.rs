//! Required-parameter resolution.
//!
//! Many describe/get operations need an identifier that only a list call can
//! supply (a queue URL, a bucket name, a cluster name). A [`ResolutionRule`]
//! declares the list calls to make and which response fields to bind; the
//! [`ParameterResolver`] runs them and returns the parameters to merge into
//! the real call.

use super::client::AwsApi;
use crate::http::ResponseCache;
use crate::traits::{ConnectorError, ConnectorResult};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// How to obtain the required parameters of one or more operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionRule {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub operations: Vec<String>,
    /// Lookups run in order; later steps may use earlier bindings.
    #[serde(default)]
    pub steps: Vec<LookupStep>,
    /// Fixed parameters added to the result.
    #[serde(default)]
    pub constants: Map<String, Value>,
    /// Parameters rendered from `{binding}`, `{region}` and `{account_id}`.
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
    /// Parameters that the API expects as a one-element list.
    #[serde(default)]
    pub list_params: Vec<String>,
    /// Bindings only used by later steps or templates, not passed on.
    #[serde(default)]
    pub internal: Vec<String>,
}

/// One list/describe call whose response supplies parameter values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LookupStep {
    pub operation: String,
    /// Request parameters; string values may reference earlier bindings as `{name}`.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// `param_name` → slash-separated path into the response (`Buckets/0/Name`).
    pub binds: BTreeMap<String, String>,
}

/// Outcome of resolving an operation's required parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The operation needs nothing beyond its static parameters.
    NotRequired,
    Resolved(Map<String, Value>),
    /// A lookup found nothing to describe; the operation should be skipped.
    Unresolvable(String),
}

impl ResolutionRule {
    pub fn applies_to(&self, service: &str, operation: &str) -> bool {
        self.service == service && self.operations.iter().any(|op| op == operation)
    }

    fn internal(mut self, names: &[&str]) -> Self {
        self.internal = names.iter().map(|n| n.to_string()).collect();
        self
    }
}

/// Runs resolution rules against an [`AwsApi`], caching lookup responses.
pub struct ParameterResolver {
    rules: Vec<ResolutionRule>,
    cache: ResponseCache<Value>,
}

impl Default for ParameterResolver {
    fn default() -> Self {
        Self::new(builtin_rules().to_vec())
    }
}

impl ParameterResolver {
    pub fn new(rules: Vec<ResolutionRule>) -> Self {
        Self {
            rules,
            cache: ResponseCache::new(Duration::from_secs(600), 2_000),
        }
    }

    /// Finds the rule for an operation.
    pub fn rule_for(&self, service: &str, operation: &str) -> Option<&ResolutionRule> {
        self.rules.iter().find(|r| r.applies_to(service, operation))
    }

    /// Resolves with the rule registered for the operation.
    pub async fn resolve(
        &self,
        service: &str,
        operation: &str,
        region: &str,
        account_id: &str,
        api: &dyn AwsApi,
    ) -> ConnectorResult<Resolution> {
        match self.rule_for(service, operation) {
            Some(rule) => self.resolve_with(rule, region, account_id, api).await,
            None => Ok(Resolution::NotRequired),
        }
    }

    /// Resolves with an explicit rule.
    ///
    /// Lookup responses are cached per account, region and request, so the
    /// four S3 operations that need a bucket share one `list_buckets` call.
    pub async fn resolve_with(
        &self,
        rule: &ResolutionRule,
        region: &str,
        account_id: &str,
        api: &dyn AwsApi,
    ) -> ConnectorResult<Resolution> {
        let mut bindings: Map<String, Value> = Map::new();

        for step in &rule.steps {
            let params = Value::Object(substitute_params(&step.params, &bindings));
            let key = format!(
                "{}/{}/{}/{}/{}",
                account_id, region, rule.service, step.operation, params
            );
            let response = self
                .cache
                .get_or_try_insert_with(key, || {
                    api.call(&rule.service, &step.operation, region, &params)
                })
                .await?;

            for (name, path) in &step.binds {
                match lookup_path(&response, path) {
                    Some(value) if !is_blank(value) => {
                        bindings.insert(name.clone(), value.clone());
                    }
                    _ => {
                        debug!(
                            service = %rule.service,
                            lookup = %step.operation,
                            path = %path,
                            "Lookup returned nothing"
                        );
                        return Ok(Resolution::Unresolvable(format!(
                            "{}:{} returned no {}",
                            rule.service, step.operation, path
                        )));
                    }
                }
            }
        }

        let mut params = bindings;
        for (name, value) in &rule.constants {
            params.insert(name.clone(), value.clone());
        }
        for (name, template) in &rule.templates {
            let rendered = render_template(template, &params, region, account_id)?;
            params.insert(name.clone(), Value::String(rendered));
        }
        for name in &rule.internal {
            params.remove(name);
        }
        for name in &rule.list_params {
            if let Some(value) = params.remove(name) {
                let wrapped = match value {
                    Value::Array(items) => Value::Array(items),
                    other => Value::Array(vec![other]),
                };
                params.insert(name.clone(), wrapped);
            }
        }

        if params.is_empty() {
            warn!(service = %rule.service, "Resolution rule produced no parameters");
            return Ok(Resolution::NotRequired);
        }
        Ok(Resolution::Resolved(params))
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Walks a slash-separated path; numeric segments index arrays.
pub fn lookup_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            Value::Object(map) => map.get(segment),
            _ => None,
        })
}

fn substitute_params(params: &Map<String, Value>, bindings: &Map<String, Value>) -> Map<String, Value> {
    params
        .iter()
        .map(|(key, value)| {
            let resolved = match value.as_str() {
                Some(s) if s.starts_with('{') && s.ends_with('}') => bindings
                    .get(&s[1..s.len() - 1])
                    .cloned()
                    .unwrap_or_else(|| value.clone()),
                _ => value.clone(),
            };
            (key.clone(), resolved)
        })
        .collect()
}

fn render_template(
    template: &str,
    bindings: &Map<String, Value>,
    region: &str,
    account_id: &str,
) -> ConnectorResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let end = rest[start..]
            .find('}')
            .map(|i| start + i)
            .ok_or_else(|| ConnectorError::ConfigError(format!("Unclosed placeholder in {}", template)))?;
        let name = &rest[start + 1..end];
        let value = match name {
            "region" => region.to_string(),
            "account_id" => account_id.to_string(),
            other => match bindings.get(other) {
                Some(Value::String(s)) => s.clone(),
                Some(v) => v.to_string(),
                None => {
                    return Err(ConnectorError::ConfigError(format!(
                        "Unknown placeholder {{{}}} in {}",
                        other, template
                    )))
                }
            },
        };
        out.push_str(&value);
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn step(operation: &str, binds: &[(&str, &str)]) -> LookupStep {
    LookupStep {
        operation: operation.to_string(),
        params: Map::new(),
        binds: binds
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

fn step_with(operation: &str, params: Value, binds: &[(&str, &str)]) -> LookupStep {
    LookupStep {
        params: params.as_object().cloned().unwrap_or_default(),
        ..step(operation, binds)
    }
}

fn rule(service: &str, operations: &[&str], steps: Vec<LookupStep>) -> ResolutionRule {
    ResolutionRule {
        service: service.to_string(),
        operations: operations.iter().map(|s| s.to_string()).collect(),
        steps,
        ..ResolutionRule::default()
    }
}

fn with_constants(mut rule: ResolutionRule, constants: Value) -> ResolutionRule {
    rule.constants = constants.as_object().cloned().unwrap_or_default();
    rule
}

static BUILTIN_RULES: Lazy<Vec<ResolutionRule>> = Lazy::new(|| {
    let mesh = || step("list_meshes", &[("meshName", "meshes/0/meshName")]);
    let router = || {
        step_with(
            "list_virtual_routers",
            json!({"meshName": "{meshName}"}),
            &[("virtualRouterName", "virtualRouters/0/virtualRouterName")],
        )
    };
    let eks_cluster = || step("list_clusters", &[("clusterName", "clusters/0")]);
    let shield_protection = || step("list_protections", &[("ProtectionId", "Protections/0/Id")]);
    let waf_list = json!({"NextMarker": "", "Limit": 50});

    vec![
        rule(
            "sqs",
            &["get_queue_attributes", "list_queue_tags"],
            vec![step("list_queues", &[("QueueUrl", "QueueUrls/0")])],
        ),
        rule(
            "sns",
            &["get_topic_attributes", "get_subscription_attributes"],
            vec![step("list_topics", &[("TopicArn", "Topics/0/TopicArn")])],
        ),
        rule(
            "secretsmanager",
            &["get_secret_value", "describe_secret"],
            vec![step("list_secrets", &[("SecretId", "SecretList/0/Name")])],
        ),
        rule(
            "s3",
            &[
                "get_bucket_location",
                "get_bucket_encryption",
                "get_bucket_website",
                "get_bucket_tagging",
            ],
            vec![step("list_buckets", &[("Bucket", "Buckets/0/Name")])],
        ),
        rule(
            "rds",
            &["describe_db_instances"],
            vec![step(
                "describe_db_instances",
                &[("DBInstanceIdentifier", "DBInstances/0/DBInstanceIdentifier")],
            )],
        ),
        ResolutionRule {
            list_params: vec!["InstanceIds".to_string()],
            ..rule(
                "ec2",
                &["describe_instances"],
                vec![step(
                    "describe_instances",
                    &[("InstanceIds", "Reservations/0/Instances/0/InstanceId")],
                )],
            )
        },
        rule(
            "kms",
            &["get_key_policy"],
            vec![step("list_keys", &[("KeyId", "Keys/0/KeyId")])],
        ),
        rule(
            "eks",
            &["describe_cluster"],
            vec![step("list_clusters", &[("name", "clusters/0")])],
        ),
        rule("eks", &["list_nodegroups", "list_fargate_profiles"], vec![eks_cluster()]),
        rule(
            "eks",
            &["describe_nodegroup"],
            vec![
                eks_cluster(),
                step_with(
                    "list_nodegroups",
                    json!({"clusterName": "{clusterName}"}),
                    &[("nodegroupName", "nodegroups/0")],
                ),
            ],
        ),
        rule(
            "eks",
            &["describe_fargate_profile"],
            vec![
                eks_cluster(),
                step_with(
                    "list_fargate_profiles",
                    json!({"clusterName": "{clusterName}"}),
                    &[("fargateProfileName", "fargateProfileNames/0")],
                ),
            ],
        ),
        rule(
            "dynamodb",
            &["describe_table", "describe_continuous_backups"],
            vec![step("list_tables", &[("TableName", "TableNames/0")])],
        ),
        rule(
            "dynamodb",
            &["describe_backup"],
            vec![step("list_backups", &[("BackupArn", "BackupSummaries/0/BackupArn")])],
        ),
        rule(
            "cloudfront",
            &["get_distribution_config"],
            vec![step("list_distributions", &[("Id", "DistributionList/Items/0/Id")])],
        ),
        rule(
            "cloudfront",
            &["list_invalidations"],
            vec![step(
                "list_distributions",
                &[("DistributionId", "DistributionList/Items/0/Id")],
            )],
        ),
        rule(
            "elbv2",
            &["describe_listeners", "describe_target_groups"],
            vec![step(
                "describe_load_balancers",
                &[("LoadBalancerArn", "LoadBalancers/0/LoadBalancerArn")],
            )],
        ),
        rule(
            "elbv2",
            &["describe_target_health"],
            vec![step(
                "describe_target_groups",
                &[("TargetGroupArn", "TargetGroups/0/TargetGroupArn")],
            )],
        ),
        with_constants(
            rule(
                "wafv2",
                &["get_rule_group"],
                vec![step_with(
                    "list_rule_groups",
                    json!({"Scope": "REGIONAL"}),
                    &[("Id", "RuleGroups/0/Id"), ("Name", "RuleGroups/0/Name")],
                )],
            ),
            json!({"Scope": "REGIONAL"}),
        ),
        with_constants(
            rule(
                "wafv2",
                &["get_web_acl"],
                vec![step_with(
                    "list_web_acls",
                    json!({"Scope": "REGIONAL"}),
                    &[("Id", "WebACLs/0/Id"), ("Name", "WebACLs/0/Name")],
                )],
            ),
            json!({"Scope": "REGIONAL"}),
        ),
        rule(
            "apigatewayv2",
            &["get_routes", "get_stages", "get_deployments"],
            vec![step("get_apis", &[("ApiId", "Items/0/ApiId")])],
        ),
        rule(
            "waf",
            &["get_web_acl"],
            vec![step("list_web_acls", &[("WebACLId", "WebACLs/0/WebACLId")])],
        ),
        rule(
            "waf",
            &["get_ip_set"],
            vec![step("list_ip_sets", &[("IPSetId", "IPSets/0/IPSetId")])],
        ),
        with_constants(rule("waf", &["list_rules"], Vec::new()), waf_list.clone()),
        with_constants(
            rule("waf-regional", &["list_rules", "list_ip_sets"], Vec::new()),
            waf_list,
        ),
        rule(
            "ssm",
            &["get_parameter"],
            vec![step("describe_parameters", &[("Name", "Parameters/0/Name")])],
        ),
        rule(
            "securityhub",
            &["get_insight_results"],
            vec![step("get_insights", &[("InsightArn", "Insights/0/InsightArn")])],
        ),
        rule(
            "macie2",
            &["describe_classification_job"],
            vec![step("list_classification_jobs", &[("jobId", "items/0/jobId")])],
        ),
        rule(
            "route53",
            &["list_traffic_policy_versions"],
            vec![step(
                "list_traffic_policies",
                &[("Id", "TrafficPolicySummaries/0/Id")],
            )],
        ),
        rule(
            "resource-groups",
            &["get_group"],
            vec![step("list_groups", &[("GroupName", "GroupIdentifiers/0/GroupName")])],
        ),
        rule(
            "redshift",
            &["describe_cluster_parameter_groups"],
            vec![step(
                "describe_cluster_parameter_groups",
                &[("ParameterGroupName", "ParameterGroups/0/ParameterGroupName")],
            )],
        ),
        rule(
            "redshift",
            &["describe_cluster_security_groups"],
            vec![step(
                "describe_cluster_security_groups",
                &[(
                    "ClusterSecurityGroupName",
                    "ClusterSecurityGroups/0/ClusterSecurityGroupName",
                )],
            )],
        ),
        rule(
            "redshift",
            &["describe_data_shares"],
            vec![
                step("describe_clusters", &[("ClusterIdentifier", "Clusters/0/ClusterIdentifier")]),
                step("describe_data_shares", &[("DataShareArn", "DataShares/0/DataShareArn")]),
            ],
        )
        .internal(&["ClusterIdentifier"]),
        rule(
            "lightsail",
            &["get_relational_database"],
            vec![step(
                "get_relational_databases",
                &[("relationalDatabaseName", "relationalDatabases/0/name")],
            )],
        ),
        rule(
            "lambda",
            &["get_function"],
            vec![step("list_functions", &[("FunctionName", "Functions/0/FunctionName")])],
        ),
        rule(
            "grafana",
            &["describe_workspace"],
            vec![step("list_workspaces", &[("workspaceId", "workspaces/0/id")])],
        ),
        rule(
            "elasticache",
            &["list_tags_for_resource"],
            vec![step(
                "describe_cache_clusters",
                &[("ResourceName", "CacheClusters/0/ARN")],
            )],
        ),
        rule(
            "network-firewall",
            &["describe_rule_group"],
            vec![step("list_rule_groups", &[("RuleGroupArn", "RuleGroups/0/Arn")])],
        ),
        rule(
            "apigateway",
            &["get_resources", "get_stages", "get_deployments"],
            vec![step("get_rest_apis", &[("restApiId", "items/0/id")])],
        ),
        rule(
            "appmesh",
            &["list_virtual_services", "list_virtual_nodes", "list_virtual_routers"],
            vec![mesh()],
        ),
        rule(
            "appmesh",
            &["describe_virtual_service"],
            vec![
                mesh(),
                step_with(
                    "list_virtual_services",
                    json!({"meshName": "{meshName}"}),
                    &[("virtualServiceName", "virtualServices/0/virtualServiceName")],
                ),
            ],
        ),
        rule(
            "appmesh",
            &["describe_virtual_node"],
            vec![
                mesh(),
                step_with(
                    "list_virtual_nodes",
                    json!({"meshName": "{meshName}"}),
                    &[("virtualNodeName", "virtualNodes/0/virtualNodeName")],
                ),
            ],
        ),
        rule(
            "appmesh",
            &["describe_virtual_router", "list_routes"],
            vec![mesh(), router()],
        ),
        rule(
            "appmesh",
            &["describe_route"],
            vec![
                mesh(),
                router(),
                step_with(
                    "list_routes",
                    json!({"meshName": "{meshName}", "virtualRouterName": "{virtualRouterName}"}),
                    &[("routeName", "routes/0/routeName")],
                ),
            ],
        ),
        rule("shield", &["describe_protection"], vec![shield_protection()]),
        ResolutionRule {
            templates: BTreeMap::from([(
                "ResourceArns".to_string(),
                "arn:aws:shield::{account_id}:protection/{ProtectionId}".to_string(),
            )]),
            list_params: vec!["ResourceArns".to_string()],
            ..rule("shield", &["list_attacks"], vec![shield_protection()])
        }
        .internal(&["ProtectionId"]),
        with_constants(
            rule("securitylake", &["list_log_sources"], Vec::new()),
            json!({"accounts": [], "regions": []}),
        ),
    ]
});

/// The built-in resolution table.
pub fn builtin_rules() -> &'static [ResolutionRule] {
    &BUILTIN_RULES
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeAwsApi;

    #[test]
    fn test_lookup_path() {
        let value = json!({"Reservations": [{"Instances": [{"InstanceId": "i-1"}]}]});
        assert_eq!(
            lookup_path(&value, "Reservations/0/Instances/0/InstanceId"),
            Some(&json!("i-1"))
        );
        assert_eq!(lookup_path(&value, "Reservations/1"), None);
        assert_eq!(lookup_path(&value, "Reservations/x"), None);
    }

    #[test]
    fn test_render_template() {
        let mut bindings = Map::new();
        bindings.insert("ProtectionId".into(), json!("p-1"));
        assert_eq!(
            render_template("arn:{region}:{account_id}:{ProtectionId}", &bindings, "us-east-1", "123")
                .unwrap(),
            "arn:us-east-1:123:p-1"
        );
        assert!(render_template("{missing}", &bindings, "r", "a").is_err());
    }

    #[test]
    fn test_rules_are_serde_loadable() {
        let rule: ResolutionRule = serde_json::from_value(json!({
            "service": "sqs",
            "operations": ["get_queue_attributes"],
            "steps": [{"operation": "list_queues", "binds": {"QueueUrl": "QueueUrls/0"}}]
        }))
        .unwrap();
        assert!(rule.applies_to("sqs", "get_queue_attributes"));
        assert!(rule.constants.is_empty());
    }

    #[test]
    fn test_builtin_table_covers_services() {
        let rules = builtin_rules();
        for (service, op) in [
            ("sqs", "list_queue_tags"),
            ("eks", "describe_fargate_profile"),
            ("dynamodb", "describe_backup"),
            ("appmesh", "describe_route"),
            ("shield", "list_attacks"),
            ("waf-regional", "list_ip_sets"),
            ("securitylake", "list_log_sources"),
            ("redshift", "describe_data_shares"),
        ] {
            assert!(
                rules.iter().any(|r| r.applies_to(service, op)),
                "missing rule for {}:{}",
                service,
                op
            );
        }
    }

    #[tokio::test]
    async fn test_resolves_bucket_and_caches_lookup() {
        let api = FakeAwsApi::new().respond("s3", "list_buckets", json!({"Buckets": [{"Name": "logs"}]}));
        let resolver = ParameterResolver::default();

        for op in ["get_bucket_encryption", "get_bucket_tagging"] {
            let resolution = resolver
                .resolve("s3", op, "us-east-1", "123456789012", &api)
                .await
                .unwrap();
            let mut expected = Map::new();
            expected.insert("Bucket".into(), json!("logs"));
            assert_eq!(resolution, Resolution::Resolved(expected));
        }
        assert_eq!(api.calls_to("s3", "list_buckets").len(), 1);
    }

    #[tokio::test]
    async fn test_empty_list_is_unresolvable() {
        let api = FakeAwsApi::new().respond("sqs", "list_queues", json!({}));
        let resolution = ParameterResolver::default()
            .resolve("sqs", "get_queue_attributes", "us-east-1", "1", &api)
            .await
            .unwrap();
        assert!(matches!(resolution, Resolution::Unresolvable(_)));
    }

    #[tokio::test]
    async fn test_chained_lookup() {
        let api = FakeAwsApi::new()
            .respond("eks", "list_clusters", json!({"clusters": ["prod"]}))
            .respond("eks", "list_nodegroups", json!({"nodegroups": ["ng-1"]}));
        let resolution = ParameterResolver::default()
            .resolve("eks", "describe_nodegroup", "us-west-2", "1", &api)
            .await
            .unwrap();
        let Resolution::Resolved(params) = resolution else {
            panic!("expected resolution");
        };
        assert_eq!(params["clusterName"], "prod");
        assert_eq!(params["nodegroupName"], "ng-1");
        assert_eq!(api.calls_to("eks", "list_nodegroups")[0].params, json!({"clusterName": "prod"}));
    }

    #[tokio::test]
    async fn test_constants_and_templates() {
        let api = FakeAwsApi::new().respond("shield", "list_protections", json!({"Protections": [{"Id": "p-9"}]}));
        let resolver = ParameterResolver::default();

        let Resolution::Resolved(params) = resolver
            .resolve("shield", "list_attacks", "us-east-1", "123456789012", &api)
            .await
            .unwrap()
        else {
            panic!("expected resolution");
        };
        assert_eq!(
            params["ResourceArns"],
            json!(["arn:aws:shield::123456789012:protection/p-9"])
        );
        assert!(params.get("ProtectionId").is_none());

        let Resolution::Resolved(params) = resolver
            .resolve("waf", "list_rules", "us-east-1", "1", &api)
            .await
            .unwrap()
        else {
            panic!("expected resolution");
        };
        assert_eq!(params["Limit"], 50);
        assert!(api.calls_to("waf", "list_rules").is_empty());
    }

    #[tokio::test]
    async fn test_unknown_operation_not_required() {
        let api = FakeAwsApi::new();
        let resolution = ParameterResolver::default()
            .resolve("iam", "list_users", "us-east-1", "1", &api)
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::NotRequired);
    }
}
