//! Static catalog of the AWS services cloudits knows how to call.
//!
//! Each service entry carries what the generic invoker needs to build a
//! request by hand: wire protocol, API version, JSON target prefix, signing
//! name and endpoint prefix. REST services additionally list a route per
//! operation.

use crate::traits::{ConnectorError, ConnectorResult};
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Wire protocol of an AWS service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// `POST /` with `X-Amz-Target` and a JSON body.
    Json,
    /// Form-encoded `Action=...&Version=...`, XML response.
    Query,
    /// The EC2 dialect of the query protocol.
    Ec2,
    /// REST routes with JSON bodies.
    RestJson,
    /// REST routes with XML bodies.
    RestXml,
}

/// Metadata for one AWS service.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Client name as used in framework mappings (`elbv2`, `waf-regional`, ...).
    pub name: &'static str,
    /// SigV4 service name.
    pub signing_name: &'static str,
    /// First DNS label of the regional endpoint.
    pub endpoint_prefix: &'static str,
    pub protocol: Protocol,
    pub api_version: &'static str,
    /// `X-Amz-Target` prefix for JSON services.
    pub target_prefix: &'static str,
    /// `application/x-amz-json-{version}`.
    pub json_version: &'static str,
    /// Global services sign for this region and use `global_host`.
    pub global_region: Option<&'static str>,
    pub global_host: Option<&'static str>,
    /// REST routes keyed by snake_case operation.
    pub routes: &'static [(&'static str, RestRoute)],
}

/// HTTP method and URI template for a REST operation.
///
/// Templates use `{Param}` placeholders; `{Param+}` keeps slashes.
/// A `?flag` suffix adds fixed query parameters.
#[derive(Debug, Clone, Copy)]
pub struct RestRoute {
    pub method: &'static str,
    pub uri: &'static str,
    /// Request members sent in the query string, with their wire keys.
    pub query: &'static [(&'static str, &'static str)],
    /// Continuation token of a paginated operation.
    pub page: Option<PageToken>,
}

/// Output field holding the next-page token and the input member that
/// sends it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageToken {
    pub output: &'static str,
    pub input: &'static str,
}

const fn get(uri: &'static str) -> RestRoute {
    RestRoute {
        method: "GET",
        uri,
        query: &[],
        page: None,
    }
}

const fn post(uri: &'static str) -> RestRoute {
    RestRoute {
        method: "POST",
        uri,
        query: &[],
        page: None,
    }
}

impl RestRoute {
    const fn with_query(self, query: &'static [(&'static str, &'static str)]) -> Self {
        RestRoute { query, ..self }
    }

    const fn paged(self, output: &'static str, input: &'static str) -> Self {
        RestRoute {
            page: Some(PageToken { output, input }),
            ..self
        }
    }

    /// Wire query key of a request member, if it travels in the query string.
    pub fn query_key(&self, member: &str) -> Option<&'static str> {
        self.query
            .iter()
            .find(|(m, _)| *m == member)
            .map(|(_, key)| *key)
    }
}

/// `NextToken` member sent as `nextToken`.
const NEXT_TOKEN_QUERY: &[(&str, &str)] = &[("NextToken", "nextToken"), ("MaxResults", "maxResults")];
/// Route 53 `Marker` member sent as `marker`.
const ROUTE53_MARKER_QUERY: &[(&str, &str)] = &[("Marker", "marker"), ("MaxItems", "maxitems")];
/// `Marker` member sent under its own name.
const MARKER_QUERY: &[(&str, &str)] = &[("Marker", "Marker"), ("MaxItems", "MaxItems")];

impl ServiceSpec {
    /// Region the request is signed for.
    pub fn signing_region<'a>(&self, region: &'a str) -> &'a str {
        match self.global_region {
            Some(global) => global,
            None => region,
        }
    }

    /// Default HTTPS endpoint for a region.
    pub fn endpoint(&self, region: &str) -> String {
        match self.global_host {
            Some(host) => format!("https://{}", host),
            None => format!("https://{}.{}.amazonaws.com", self.endpoint_prefix, region),
        }
    }

    /// Looks up the REST route of an operation.
    pub fn route(&self, operation: &str) -> ConnectorResult<RestRoute> {
        self.routes
            .iter()
            .find(|(op, _)| *op == operation)
            .map(|(_, route)| *route)
            .ok_or_else(|| {
                ConnectorError::ConfigError(format!(
                    "No REST route known for {}:{}",
                    self.name, operation
                ))
            })
    }

    /// Continuation token declared for a REST operation.
    pub fn page_token(&self, operation: &str) -> Option<PageToken> {
        self.route(operation).ok().and_then(|route| route.page)
    }

    /// Derives the wire action name (`describe_db_instances` → `DescribeDBInstances`).
    pub fn action_name(&self, operation: &str) -> String {
        if let Some(action) = ACTION_OVERRIDES
            .iter()
            .find(|(op, _)| *op == operation)
            .map(|(_, action)| *action)
        {
            return action.to_string();
        }

        let waf = self.name.starts_with("waf");
        operation
            .split('_')
            .filter(|w| !w.is_empty())
            .map(|word| match word {
                "db" => "DB".to_string(),
                "ip" => "IP".to_string(),
                "mfa" => "MFA".to_string(),
                "saml" => "SAML".to_string(),
                "ssl" => "SSL".to_string(),
                "acl" if waf => "ACL".to_string(),
                "acls" if waf => "ACLs".to_string(),
                other => capitalize(other),
            })
            .collect()
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

const ACTION_OVERRIDES: &[(&str, &str)] = &[
    ("list_open_id_connect_providers", "ListOpenIDConnectProviders"),
    ("describe_vpc_endpoint_services", "DescribeVpcEndpointServices"),
];

static CATALOG: Lazy<HashMap<&'static str, ServiceSpec>> = Lazy::new(|| {
    let specs = vec![
        json("sqs", "sqs", "AmazonSQS", "1.0", "2012-11-05"),
        query("sns", "sns", "2010-03-31"),
        json("secretsmanager", "secretsmanager", "secretsmanager", "1.1", "2017-10-17"),
        ServiceSpec {
            routes: S3_ROUTES,
            ..rest_xml("s3", "s3", "2006-03-01")
        },
        query("rds", "rds", "2014-10-31"),
        ServiceSpec {
            protocol: Protocol::Ec2,
            ..query("ec2", "ec2", "2016-11-15")
        },
        json("kms", "kms", "TrentService", "1.1", "2014-11-01"),
        ServiceSpec {
            routes: EKS_ROUTES,
            ..rest_json("eks", "eks", "2017-11-01")
        },
        json("dynamodb", "dynamodb", "DynamoDB_20120810", "1.0", "2012-08-10"),
        ServiceSpec {
            routes: CLOUDFRONT_ROUTES,
            global_region: Some("us-east-1"),
            global_host: Some("cloudfront.amazonaws.com"),
            ..rest_xml("cloudfront", "cloudfront", "2020-05-31")
        },
        ServiceSpec {
            signing_name: "elasticloadbalancing",
            ..query("elbv2", "elasticloadbalancing", "2015-12-01")
        },
        ServiceSpec {
            signing_name: "elasticloadbalancing",
            ..query("elb", "elasticloadbalancing", "2012-06-01")
        },
        json("wafv2", "wafv2", "AWSWAF_20190729", "1.1", "2019-07-29"),
        ServiceSpec {
            global_region: Some("us-east-1"),
            global_host: Some("waf.amazonaws.com"),
            ..json("waf", "waf", "AWSWAF_20150824", "1.1", "2015-08-24")
        },
        json(
            "waf-regional",
            "waf-regional",
            "AWSWAF_Regional_20161128",
            "1.1",
            "2016-11-28",
        ),
        ServiceSpec {
            signing_name: "apigateway",
            routes: APIGATEWAYV2_ROUTES,
            ..rest_json("apigatewayv2", "apigateway", "2018-11-29")
        },
        ServiceSpec {
            routes: APIGATEWAY_ROUTES,
            ..rest_json("apigateway", "apigateway", "2015-07-09")
        },
        json("ssm", "ssm", "AmazonSSM", "1.1", "2014-11-06"),
        ServiceSpec {
            routes: SECURITYHUB_ROUTES,
            ..rest_json("securityhub", "securityhub", "2018-10-26")
        },
        ServiceSpec {
            routes: MACIE2_ROUTES,
            ..rest_json("macie2", "macie2", "2020-01-01")
        },
        ServiceSpec {
            routes: ROUTE53_ROUTES,
            global_region: Some("us-east-1"),
            global_host: Some("route53.amazonaws.com"),
            ..rest_xml("route53", "route53", "2013-04-01")
        },
        ServiceSpec {
            routes: RESOURCE_GROUPS_ROUTES,
            ..rest_json("resource-groups", "resource-groups", "2017-11-27")
        },
        query("redshift", "redshift", "2012-12-01"),
        json("lightsail", "lightsail", "Lightsail_20161128", "1.1", "2016-11-28"),
        ServiceSpec {
            routes: LAMBDA_ROUTES,
            ..rest_json("lambda", "lambda", "2015-03-31")
        },
        ServiceSpec {
            routes: GRAFANA_ROUTES,
            ..rest_json("grafana", "grafana", "2020-08-18")
        },
        query("elasticache", "elasticache", "2015-02-02"),
        json(
            "network-firewall",
            "network-firewall",
            "NetworkFirewall_20201112",
            "1.0",
            "2020-11-12",
        ),
        ServiceSpec {
            routes: APPMESH_ROUTES,
            ..rest_json("appmesh", "appmesh", "2019-01-25")
        },
        ServiceSpec {
            global_region: Some("us-east-1"),
            global_host: Some("shield.us-east-1.amazonaws.com"),
            ..json("shield", "shield", "AWSShield_20160616", "1.1", "2016-06-02")
        },
        ServiceSpec {
            routes: SECURITYLAKE_ROUTES,
            ..rest_json("securitylake", "securitylake", "2018-05-10")
        },
        ServiceSpec {
            global_region: Some("us-east-1"),
            global_host: Some("iam.amazonaws.com"),
            ..query("iam", "iam", "2010-05-08")
        },
        json(
            "cloudtrail",
            "cloudtrail",
            "com.amazonaws.cloudtrail.v20131101.CloudTrail_20131101",
            "1.1",
            "2013-11-01",
        ),
        json("config", "config", "StarlingDoveService", "1.1", "2014-11-12"),
        ServiceSpec {
            routes: GUARDDUTY_ROUTES,
            ..rest_json("guardduty", "guardduty", "2017-11-28")
        },
        json("acm", "acm", "CertificateManager", "1.1", "2015-12-08"),
        json("logs", "logs", "Logs_20140328", "1.1", "2014-03-28"),
        query("cloudwatch", "monitoring", "2010-08-01"),
        ServiceSpec {
            routes: BACKUP_ROUTES,
            ..rest_json("backup", "backup", "2018-11-15")
        },
        ServiceSpec {
            signing_name: "ecr",
            ..json(
                "ecr",
                "api.ecr",
                "AmazonEC2ContainerRegistry_V20150921",
                "1.1",
                "2015-09-21",
            )
        },
        json(
            "ecs",
            "ecs",
            "AmazonEC2ContainerServiceV20141113",
            "1.1",
            "2014-11-13",
        ),
        ServiceSpec {
            global_region: Some("us-east-1"),
            global_host: Some("organizations.us-east-1.amazonaws.com"),
            ..json(
                "organizations",
                "organizations",
                "AWSOrganizationsV20161128",
                "1.1",
                "2016-11-28",
            )
        },
        ServiceSpec {
            signing_name: "ses",
            ..query("ses", "email", "2010-12-01")
        },
        query("autoscaling", "autoscaling", "2011-01-01"),
        ServiceSpec {
            routes: INSPECTOR2_ROUTES,
            ..rest_json("inspector2", "inspector2", "2020-06-08")
        },
        ServiceSpec {
            signing_name: "access-analyzer",
            routes: ACCESSANALYZER_ROUTES,
            ..rest_json("accessanalyzer", "access-analyzer", "2019-11-01")
        },
        ServiceSpec {
            signing_name: "elasticfilesystem",
            routes: EFS_ROUTES,
            ..rest_json("efs", "elasticfilesystem", "2015-02-01")
        },
        json(
            "cognito-idp",
            "cognito-idp",
            "AWSCognitoIdentityProviderService",
            "1.1",
            "2016-04-18",
        ),
    ];
    specs.into_iter().map(|s| (s.name, s)).collect()
});

fn base(name: &'static str, prefix: &'static str, protocol: Protocol, version: &'static str) -> ServiceSpec {
    ServiceSpec {
        name,
        signing_name: prefix,
        endpoint_prefix: prefix,
        protocol,
        api_version: version,
        target_prefix: "",
        json_version: "1.1",
        global_region: None,
        global_host: None,
        routes: &[],
    }
}

fn json(
    name: &'static str,
    prefix: &'static str,
    target: &'static str,
    json_version: &'static str,
    version: &'static str,
) -> ServiceSpec {
    ServiceSpec {
        target_prefix: target,
        json_version,
        ..base(name, prefix, Protocol::Json, version)
    }
}

fn query(name: &'static str, prefix: &'static str, version: &'static str) -> ServiceSpec {
    base(name, prefix, Protocol::Query, version)
}

fn rest_json(name: &'static str, prefix: &'static str, version: &'static str) -> ServiceSpec {
    base(name, prefix, Protocol::RestJson, version)
}

fn rest_xml(name: &'static str, prefix: &'static str, version: &'static str) -> ServiceSpec {
    base(name, prefix, Protocol::RestXml, version)
}

/// Looks up a service by its mapping name.
pub fn service(name: &str) -> ConnectorResult<&'static ServiceSpec> {
    CATALOG
        .get(name)
        .ok_or_else(|| ConnectorError::ConfigError(format!("Unsupported AWS service: {}", name)))
}

/// Returns true if the catalog knows the service.
pub fn is_known_service(name: &str) -> bool {
    CATALOG.contains_key(name)
}

/// Names of every service in the catalog, sorted.
pub fn known_services() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = CATALOG.keys().copied().collect();
    names.sort_unstable();
    names
}

/// Pages on a `NextToken` output that goes back as the `nextToken` query key.
const fn next_token(route: RestRoute) -> RestRoute {
    route.with_query(NEXT_TOKEN_QUERY).paged("NextToken", "NextToken")
}

static S3_ROUTES: &[(&str, RestRoute)] = &[
    ("list_buckets", get("/")),
    ("get_bucket_location", get("/{Bucket}?location")),
    ("get_bucket_encryption", get("/{Bucket}?encryption")),
    ("get_bucket_website", get("/{Bucket}?website")),
    ("get_bucket_tagging", get("/{Bucket}?tagging")),
    ("get_bucket_versioning", get("/{Bucket}?versioning")),
    ("get_bucket_logging", get("/{Bucket}?logging")),
    ("get_bucket_policy_status", get("/{Bucket}?policyStatus")),
    ("get_bucket_lifecycle_configuration", get("/{Bucket}?lifecycle")),
    ("get_bucket_replication", get("/{Bucket}?replication")),
    ("get_public_access_block", get("/{Bucket}?publicAccessBlock")),
];

static EKS_ROUTES: &[(&str, RestRoute)] = &[
    ("list_clusters", get("/clusters")),
    ("describe_cluster", get("/clusters/{name}")),
    ("list_nodegroups", get("/clusters/{clusterName}/node-groups")),
    (
        "describe_nodegroup",
        get("/clusters/{clusterName}/node-groups/{nodegroupName}"),
    ),
    ("list_fargate_profiles", get("/clusters/{clusterName}/fargate-profiles")),
    (
        "describe_fargate_profile",
        get("/clusters/{clusterName}/fargate-profiles/{fargateProfileName}"),
    ),
    ("list_addons", get("/clusters/{clusterName}/addons")),
];

static CLOUDFRONT_ROUTES: &[(&str, RestRoute)] = &[
    ("list_distributions", get("/2020-05-31/distribution")),
    ("get_distribution_config", get("/2020-05-31/distribution/{Id}/config")),
    (
        "list_invalidations",
        get("/2020-05-31/distribution/{DistributionId}/invalidation"),
    ),
    ("list_origin_access_controls", get("/2020-05-31/origin-access-control")),
];

static APIGATEWAYV2_ROUTES: &[(&str, RestRoute)] = &[
    ("get_apis", next_token(get("/v2/apis"))),
    ("get_routes", next_token(get("/v2/apis/{ApiId}/routes"))),
    ("get_stages", next_token(get("/v2/apis/{ApiId}/stages"))),
    ("get_deployments", next_token(get("/v2/apis/{ApiId}/deployments"))),
];

static APIGATEWAY_ROUTES: &[(&str, RestRoute)] = &[
    ("get_rest_apis", get("/restapis")),
    ("get_resources", get("/restapis/{restApiId}/resources")),
    ("get_stages", get("/restapis/{restApiId}/stages")),
    ("get_deployments", get("/restapis/{restApiId}/deployments")),
    ("get_api_keys", get("/apikeys")),
];

static SECURITYHUB_ROUTES: &[(&str, RestRoute)] = &[
    ("describe_hub", get("/accounts")),
    ("get_enabled_standards", post("/standards/get")),
    ("get_insights", post("/insights/get")),
    ("get_insight_results", get("/insights/results/{InsightArn+}")),
    ("get_findings", post("/findings")),
];

static MACIE2_ROUTES: &[(&str, RestRoute)] = &[
    ("list_classification_jobs", post("/jobs/list")),
    ("describe_classification_job", get("/jobs/{jobId}")),
    ("get_macie_session", get("/macie")),
];

static ROUTE53_ROUTES: &[(&str, RestRoute)] = &[
    (
        "list_hosted_zones",
        get("/2013-04-01/hostedzone")
            .with_query(ROUTE53_MARKER_QUERY)
            .paged("NextMarker", "Marker"),
    ),
    (
        "list_traffic_policies",
        get("/2013-04-01/trafficpolicies")
            .with_query(&[("TrafficPolicyIdMarker", "trafficpolicyid"), ("MaxItems", "maxitems")])
            .paged("TrafficPolicyIdMarker", "TrafficPolicyIdMarker"),
    ),
    (
        "list_traffic_policy_versions",
        get("/2013-04-01/trafficpolicies/{Id}/versions")
            .with_query(&[
                ("TrafficPolicyVersionMarker", "trafficpolicyversion"),
                ("MaxItems", "maxitems"),
            ])
            .paged("TrafficPolicyVersionMarker", "TrafficPolicyVersionMarker"),
    ),
    (
        "list_health_checks",
        get("/2013-04-01/healthcheck")
            .with_query(ROUTE53_MARKER_QUERY)
            .paged("NextMarker", "Marker"),
    ),
];

static RESOURCE_GROUPS_ROUTES: &[(&str, RestRoute)] = &[
    ("list_groups", next_token(post("/groups-list"))),
    ("get_group", post("/get-group")),
];

static LAMBDA_ROUTES: &[(&str, RestRoute)] = &[
    (
        "list_functions",
        get("/2015-03-31/functions/")
            .with_query(MARKER_QUERY)
            .paged("NextMarker", "Marker"),
    ),
    ("get_function", get("/2015-03-31/functions/{FunctionName}")),
    ("get_account_settings", get("/2016-08-19/account-settings/")),
];

static GRAFANA_ROUTES: &[(&str, RestRoute)] = &[
    ("list_workspaces", get("/workspaces")),
    ("describe_workspace", get("/workspaces/{workspaceId}")),
];

static APPMESH_ROUTES: &[(&str, RestRoute)] = &[
    ("list_meshes", get("/v20190125/meshes")),
    ("describe_mesh", get("/v20190125/meshes/{meshName}")),
    (
        "list_virtual_services",
        get("/v20190125/meshes/{meshName}/virtualServices"),
    ),
    (
        "describe_virtual_service",
        get("/v20190125/meshes/{meshName}/virtualServices/{virtualServiceName}"),
    ),
    ("list_virtual_nodes", get("/v20190125/meshes/{meshName}/virtualNodes")),
    (
        "describe_virtual_node",
        get("/v20190125/meshes/{meshName}/virtualNodes/{virtualNodeName}"),
    ),
    (
        "list_virtual_routers",
        get("/v20190125/meshes/{meshName}/virtualRouters"),
    ),
    (
        "describe_virtual_router",
        get("/v20190125/meshes/{meshName}/virtualRouters/{virtualRouterName}"),
    ),
    (
        "list_routes",
        get("/v20190125/meshes/{meshName}/virtualRouter/{virtualRouterName}/routes"),
    ),
    (
        "describe_route",
        get("/v20190125/meshes/{meshName}/virtualRouter/{virtualRouterName}/routes/{routeName}"),
    ),
];

static SECURITYLAKE_ROUTES: &[(&str, RestRoute)] = &[
    ("list_log_sources", post("/v1/datalake/logsources/list")),
    ("list_data_lakes", get("/v1/datalakes")),
];

static GUARDDUTY_ROUTES: &[(&str, RestRoute)] = &[
    ("list_detectors", next_token(get("/detector"))),
    ("get_detector", get("/detector/{DetectorId}")),
];

static BACKUP_ROUTES: &[(&str, RestRoute)] = &[
    ("list_backup_plans", next_token(get("/backup/plans/"))),
    ("list_backup_vaults", next_token(get("/backup-vaults/"))),
];

static INSPECTOR2_ROUTES: &[(&str, RestRoute)] = &[
    ("list_findings", post("/findings/list")),
    ("list_coverage", post("/coverage/list")),
];

static ACCESSANALYZER_ROUTES: &[(&str, RestRoute)] = &[("list_analyzers", get("/analyzer"))];

static EFS_ROUTES: &[(&str, RestRoute)] = &[(
    "describe_file_systems",
    get("/2015-02-01/file-systems")
        .with_query(MARKER_QUERY)
        .paged("NextMarker", "Marker"),
)];
