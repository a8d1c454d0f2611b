// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use http::{HeaderMap, HeaderName};

use crate::requests::RequestId;

/// Header carrying [`RequestId`]; [`RequestId::FIELD`] in the form `HeaderMap::insert` accepts.
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Takes the request id from the headers. Missing, repeated or non-UTF-8 headers give
/// [`RequestId::unknown`].
impl From<&HeaderMap> for RequestId {
    fn from(headers: &HeaderMap) -> Self {
        let mut req_ids = headers.get_all(REQUEST_ID_HEADER).iter();
        req_ids
            .next()
            .filter(|_| req_ids.next().is_none())
            .and_then(|r_id| Self::from_bytes(r_id.as_bytes()).ok())
            .unwrap_or(Self::unknown())
    }
}
