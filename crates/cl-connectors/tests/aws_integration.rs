//! Signed AWS calls, parameter resolution and pagination against a mock endpoint.

use cl_connectors::cloud::aws::{
    AwsApi, AwsClientOptions, AwsCredentials, AwsHttpClient, Paginator, ParameterResolver,
    Resolution,
};
use cl_connectors::ConnectorError;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{
    body_string_contains, header, header_exists, method, path, query_param, query_param_is_missing,
};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer, max_retries: u32) -> AwsHttpClient {
    let credentials = AwsCredentials::new("AKIDEXAMPLE", "secret").with_session_token("session");
    AwsHttpClient::new(
        credentials,
        AwsClientOptions {
            timeout: Duration::from_secs(5),
            max_retries,
            endpoint_override: Some(server.uri()),
        },
    )
    .unwrap()
}

#[tokio::test]
async fn test_json_protocol_call_is_signed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(header("x-amz-target", "AmazonSQS.ListQueues"))
        .and(header_exists("authorization"))
        .and(header("x-amz-security-token", "session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "QueueUrls": ["https://sqs.us-east-1.amazonaws.com/123456789012/audit"]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let out = client(&server, 0)
        .call("sqs", "list_queues", "us-east-1", &json!({}))
        .await
        .unwrap();
    assert_eq!(out["QueueUrls"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_query_protocol_xml_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=ListUsers"))
        .and(body_string_contains("Version=2010-05-08"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<ListUsersResponse xmlns="https://iam.amazonaws.com/doc/2010-05-08/">
                 <ListUsersResult>
                   <IsTruncated>false</IsTruncated>
                   <Users>
                     <member><UserName>alice</UserName><UserId>AID1</UserId></member>
                     <member><UserName>bob</UserName><UserId>AID2</UserId></member>
                   </Users>
                 </ListUsersResult>
                 <ResponseMetadata><RequestId>req-1</RequestId></ResponseMetadata>
               </ListUsersResponse>"#,
        ))
        .mount(&server)
        .await;

    let out = client(&server, 0)
        .call("iam", "list_users", "us-east-1", &json!({}))
        .await
        .unwrap();
    assert_eq!(out["Users"][1]["UserName"], "bob");
    assert_eq!(out["ResponseMetadata"]["RequestId"], "req-1");
}

#[tokio::test]
async fn test_access_denied_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "__type": "com.amazonaws.kms#AccessDeniedException",
            "message": "not allowed"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server, 3)
        .call("kms", "list_keys", "us-east-1", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::AuthorizationDenied(_)));
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Keys": []})))
        .mount(&server)
        .await;

    let out = client(&server, 2)
        .call("kms", "list_keys", "us-east-1", &json!({}))
        .await
        .unwrap();
    assert_eq!(out["Keys"], json!([]));
}

#[tokio::test]
async fn test_chained_resolution_over_rest_json() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/clusters"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"clusters": ["prod"]})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/clusters/prod/node-groups"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"nodegroups": ["ng-1"]})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/clusters/prod/node-groups/ng-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "nodegroup": {"nodegroupName": "ng-1", "status": "ACTIVE"}
        })))
        .mount(&server)
        .await;

    let api = client(&server, 0);
    let resolver = ParameterResolver::default();
    let resolution = resolver
        .resolve("eks", "describe_nodegroup", "us-east-1", "123456789012", &api)
        .await
        .unwrap();
    let Resolution::Resolved(params) = resolution else {
        panic!("expected resolved parameters, got {:?}", resolution);
    };
    assert_eq!(params["clusterName"], "prod");
    assert_eq!(params["nodegroupName"], "ng-1");

    let out = api
        .call("eks", "describe_nodegroup", "us-east-1", &serde_json::Value::Object(params))
        .await
        .unwrap();
    assert_eq!(out["nodegroup"]["status"], "ACTIVE");

    // Cached: a second resolution does not list clusters again.
    resolver
        .resolve("eks", "list_nodegroups", "us-east-1", "123456789012", &api)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unresolvable_when_lookup_is_empty() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("x-amz-target", "AmazonSQS.ListQueues"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let resolution = ParameterResolver::default()
        .resolve("sqs", "get_queue_attributes", "us-east-1", "123456789012", &client(&server, 0))
        .await
        .unwrap();
    assert!(matches!(resolution, Resolution::Unresolvable(_)));
}

#[tokio::test]
async fn test_paginator_over_rest_json_next_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/clusters"))
        .and(query_param("nextToken", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"clusters": ["b"]})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/clusters"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "clusters": ["a"],
            "nextToken": "page-2"
        })))
        .mount(&server)
        .await;

    let api = client(&server, 0);
    let out = Paginator::new(&api, 5)
        .call_all("eks", "list_clusters", "us-east-1", &json!({}))
        .await
        .unwrap();
    assert_eq!(out, json!({"clusters": ["a", "b"]}));
}

/// Serves two pages of a GET operation. The first page only answers a
/// request without `token_key`, so resending it under the wrong key fails
/// the `expect(1)`.
async fn mount_two_pages(
    server: &MockServer,
    route: &str,
    token_key: &str,
    token: &str,
    first: ResponseTemplate,
    second: ResponseTemplate,
) {
    Mock::given(method("GET"))
        .and(path(route))
        .and(query_param_is_missing(token_key))
        .respond_with(first)
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(route))
        .and(query_param(token_key, token))
        .respond_with(second)
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_guardduty_next_token_goes_back_as_query_key() {
    let server = MockServer::start().await;
    mount_two_pages(
        &server,
        "/detector",
        "nextToken",
        "t1",
        ResponseTemplate::new(200).set_body_json(json!({"DetectorIds": ["d1"], "NextToken": "t1"})),
        ResponseTemplate::new(200).set_body_json(json!({"DetectorIds": ["d2"]})),
    )
    .await;

    let api = client(&server, 0);
    let out = Paginator::new(&api, 5)
        .call_all("guardduty", "list_detectors", "us-east-1", &json!({}))
        .await
        .unwrap();
    assert_eq!(out, json!({"DetectorIds": ["d1", "d2"]}));
}

#[tokio::test]
async fn test_backup_plans_follow_next_token() {
    let server = MockServer::start().await;
    mount_two_pages(
        &server,
        "/backup/plans/",
        "nextToken",
        "plans-2",
        ResponseTemplate::new(200).set_body_json(json!({
            "BackupPlansList": [{"BackupPlanName": "daily"}],
            "NextToken": "plans-2"
        })),
        ResponseTemplate::new(200).set_body_json(json!({
            "BackupPlansList": [{"BackupPlanName": "weekly"}]
        })),
    )
    .await;

    let api = client(&server, 0);
    let out = Paginator::new(&api, 5)
        .call_all("backup", "list_backup_plans", "us-east-1", &json!({}))
        .await
        .unwrap();
    assert_eq!(out["BackupPlansList"][1]["BackupPlanName"], "weekly");
    assert!(out.get("NextToken").is_none());
}

#[tokio::test]
async fn test_route53_next_marker_goes_back_as_marker() {
    let server = MockServer::start().await;
    mount_two_pages(
        &server,
        "/2013-04-01/hostedzone",
        "marker",
        "Z2",
        ResponseTemplate::new(200).set_body_string(
            r#"<ListHostedZonesResponse xmlns="https://route53.amazonaws.com/doc/2013-04-01/">
                 <HostedZones>
                   <HostedZone><Id>/hostedzone/Z1</Id><Name>a.example.</Name></HostedZone>
                 </HostedZones>
                 <IsTruncated>true</IsTruncated>
                 <NextMarker>Z2</NextMarker>
                 <MaxItems>1</MaxItems>
               </ListHostedZonesResponse>"#,
        ),
        ResponseTemplate::new(200).set_body_string(
            r#"<ListHostedZonesResponse xmlns="https://route53.amazonaws.com/doc/2013-04-01/">
                 <HostedZones>
                   <HostedZone><Id>/hostedzone/Z2</Id><Name>b.example.</Name></HostedZone>
                 </HostedZones>
                 <IsTruncated>false</IsTruncated>
                 <MaxItems>1</MaxItems>
               </ListHostedZonesResponse>"#,
        ),
    )
    .await;

    let api = client(&server, 0);
    let out = Paginator::new(&api, 5)
        .call_all("route53", "list_hosted_zones", "us-east-1", &json!({}))
        .await
        .unwrap();
    let zones = out["HostedZones"].as_array().unwrap();
    assert_eq!(zones.len(), 2);
    assert_eq!(zones[1]["Name"], "b.example.");
    assert_eq!(out["IsTruncated"], false);
}

#[tokio::test]
async fn test_lambda_next_marker_goes_back_as_marker() {
    let server = MockServer::start().await;
    mount_two_pages(
        &server,
        "/2015-03-31/functions/",
        "Marker",
        "m2",
        ResponseTemplate::new(200).set_body_json(json!({
            "Functions": [{"FunctionName": "ingest"}],
            "NextMarker": "m2"
        })),
        ResponseTemplate::new(200).set_body_json(json!({
            "Functions": [{"FunctionName": "report"}]
        })),
    )
    .await;

    let api = client(&server, 0);
    let out = Paginator::new(&api, 5)
        .call_all("lambda", "list_functions", "us-east-1", &json!({}))
        .await
        .unwrap();
    assert_eq!(
        out,
        json!({"Functions": [{"FunctionName": "ingest"}, {"FunctionName": "report"}]})
    );
}
