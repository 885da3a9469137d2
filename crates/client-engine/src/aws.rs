//! AWS SDK client construction from a join-issued credential bundle.

use aws_credential_types::provider::SharedCredentialsProvider;
use aws_credential_types::Credentials;

use crate::backend::CredentialBundle;

/// All ingest resources live in this region.
pub(crate) const AWS_REGION: &str = "us-east-1";

fn shared_provider(bundle: &CredentialBundle) -> SharedCredentialsProvider {
    SharedCredentialsProvider::new(Credentials::new(
        bundle.access_key.clone(),
        bundle.secret_key.clone(),
        bundle.session_token.clone(),
        None,
        "ingest-join",
    ))
}

pub(crate) fn s3_client(bundle: &CredentialBundle) -> aws_sdk_s3::Client {
    let config = aws_sdk_s3::Config::builder()
        .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
        .region(aws_sdk_s3::config::Region::new(AWS_REGION))
        .credentials_provider(shared_provider(bundle))
        .build();
    aws_sdk_s3::Client::from_conf(config)
}

pub(crate) fn sqs_client(bundle: &CredentialBundle) -> aws_sdk_sqs::Client {
    let config = aws_sdk_sqs::Config::builder()
        .behavior_version(aws_sdk_sqs::config::BehaviorVersion::latest())
        .region(aws_sdk_sqs::config::Region::new(AWS_REGION))
        .credentials_provider(shared_provider(bundle))
        .build();
    aws_sdk_sqs::Client::from_conf(config)
}
