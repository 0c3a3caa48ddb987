//! IAM authorizer: answers "who am I" and "what are you" over a connection.
//!
//! Both questions are plain resource queries on the device (`/iam/me` and
//! `/iam/pairing`).  A `404` on `/iam/me` means the device has no user for
//! this client, which the Connector reports as "not paired".

use std::sync::Arc;

use async_trait::async_trait;
use edge_core::protocol::{decode_pairing_info, decode_user, paths};
use edge_core::{PairingInfo, User};

use crate::application::connect_device::{AuthError, Authorizer};
use crate::application::transport::SecureConnection;

#[derive(Debug, Default, Clone, Copy)]
pub struct IamAuthorizer;

impl IamAuthorizer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Authorizer for IamAuthorizer {
    async fn self_identity(
        &self,
        connection: Arc<dyn SecureConnection>,
    ) -> Result<Option<User>, AuthError> {
        let response = connection.query(paths::IAM_ME).await?;
        decode_user(&response).map_err(|source| AuthError::Payload {
            path: paths::IAM_ME,
            source,
        })
    }

    async fn pairing_info(
        &self,
        connection: Arc<dyn SecureConnection>,
    ) -> Result<PairingInfo, AuthError> {
        let response = connection.query(paths::IAM_PAIRING).await?;
        decode_pairing_info(&response).map_err(|source| AuthError::Payload {
            path: paths::IAM_PAIRING,
            source,
        })
    }
}
