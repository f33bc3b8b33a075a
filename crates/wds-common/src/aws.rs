//! AWS client construction
//!
//! One shared config load produces every service client a binary needs. An
//! endpoint override (LocalStack, MinIO) redirects all three services and
//! switches S3 to path-style addressing.

use aws_config::BehaviorVersion;

/// Handles to every AWS service the pipeline touches.
#[derive(Clone)]
pub struct AwsClients {
    pub s3: aws_sdk_s3::Client,
    pub sqs: aws_sdk_sqs::Client,
    pub dynamodb: aws_sdk_dynamodb::Client,
}

/// Build service clients from the ambient AWS environment.
///
/// `endpoint` overrides the service endpoint for local development.
pub async fn load_clients(endpoint: Option<&str>) -> AwsClients {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());

    if let Some(url) = endpoint {
        loader = loader.endpoint_url(url);
    }

    let config = loader.load().await;

    let s3 = if endpoint.is_some() {
        let s3_config = aws_sdk_s3::config::Builder::from(&config)
            .force_path_style(true)
            .build();
        aws_sdk_s3::Client::from_conf(s3_config)
    } else {
        aws_sdk_s3::Client::new(&config)
    };

    AwsClients {
        s3,
        sqs: aws_sdk_sqs::Client::new(&config),
        dynamodb: aws_sdk_dynamodb::Client::new(&config),
    }
}
