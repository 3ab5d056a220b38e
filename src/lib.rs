//! Blocking OData V2/V4 client protocol engine.
//!
//! The crate builds resource URIs with key and parameter encodings, executes single and batched
//! requests through a caller supplied [`Transport`], and decodes responses into JSON trees or
//! `serde` types.
//!
//! # Public API Overview
//! - Describe resources with [`ResourcePath`] and [`ParameterSet`], values with [`ODataLiteral`].
//! - Build requests with the [`ODataRequest`] constructors and execute them against a
//!   [`SharedTransport`]. State-changing requests run through the CSRF handshake first.
//! - Group requests with [`BatchRequest`]; read sub-responses from [`BatchResponse`].
//! - Decode an [`ODataResponse`] as entity, collection, primitive or map, stream its result set,
//!   or follow its next links with [`ODataResponse::pages`].
//!
//! Every failure is an [`ODataError`]; its [`ODataErrorKind`] tells connection problems,
//! construction errors, unhealthy responses, service errors and deserialization failures apart.

pub mod batch;
pub mod csrf;
pub mod error;
pub mod headers;
pub mod literal;
pub mod multipart;
pub mod parameters;
pub mod protocol;
pub mod request;
pub mod resource_path;
pub mod response;
pub mod service_error;
pub mod transport;
pub mod uri;

pub use crate::batch::{
    BatchChangeset, BatchItem, BatchItemSingle, BatchRequest, BatchResponse, BatchResponsePosition,
    Changeset, UuidProvider,
};
pub use crate::csrf::{
    CsrfCoordinator, CsrfTokenRetriever, DefaultCsrfTokenRetriever, DisabledCsrfTokenRetriever,
};
pub use crate::error::{ODataError, ODataErrorKind, RequestSummary};
pub use crate::headers::HeaderMap;
pub use crate::literal::ODataLiteral;
pub use crate::multipart::{MultipartEntry, MultipartParser, MultipartPart};
pub use crate::parameters::{ParameterPosition, ParameterSet, ParameterStyle};
pub use crate::protocol::ODataProtocol;
pub use crate::request::{ODataRequest, RequestKind, RequestListener, RequestModel, UpdateStrategy};
pub use crate::resource_path::{PathSegment, ResourcePath};
pub use crate::response::{ODataResponse, Pages};
pub use crate::service_error::ODataServiceError;
pub use crate::transport::{
    HttpMethod, HttpRequest, RawResponse, ResponseBody, SharedTransport, Transport, TransportError,
};
pub use crate::uri::{extract_delta_token, extract_skip_token, UriEncodingStrategy};
