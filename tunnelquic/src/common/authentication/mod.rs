// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Types supporting authentication of tunnel connections and interception of their streams
#[deny(unused_imports)]
mod traits;
pub use traits::*;

mod no_op_authentication;
pub use no_op_authentication::{AllowAllAuthorizer, FixedIdentityAuthorizer};

mod credential_authentication;
pub use credential_authentication::{CredentialKeyAuthorizer, SharedSecretAuthorizer};
