//! Shared metric model for the tally agent and server.
//!
//! Holds the typed [`types::Metric`] representation, its JSON wire form,
//! per-record HMAC signing, hybrid payload encryption and the gRPC
//! message types used by both sides of the exchange.

pub mod crypto;
pub mod error;
pub mod id;
pub mod sign;
pub mod types;

pub mod proto {
    #![allow(clippy::pedantic)]
    #![allow(clippy::missing_errors_doc)]
    #![allow(clippy::doc_markdown)]
    #![allow(clippy::default_trait_access)]

    /// A batch of metric records delivered in one call.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct MetricBatchProto {
        /// Client-assigned id used by the server to drop replays.
        #[prost(string, tag = "1")]
        pub batch_id: ::prost::alloc::string::String,
        #[prost(message, repeated, tag = "2")]
        pub metrics: ::prost::alloc::vec::Vec<MetricProto>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct MetricProto {
        #[prost(string, tag = "1")]
        pub id: ::prost::alloc::string::String,
        /// `gauge` or `counter`.
        #[prost(string, tag = "2")]
        pub kind: ::prost::alloc::string::String,
        #[prost(int64, optional, tag = "3")]
        pub delta: ::core::option::Option<i64>,
        #[prost(double, optional, tag = "4")]
        pub value: ::core::option::Option<f64>,
        /// Hex HMAC-SHA256 tag, empty when the agent has no signing key.
        #[prost(string, tag = "5")]
        pub hash: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct UpdateBatchResponse {
        #[prost(bool, tag = "1")]
        pub success: bool,
        #[prost(string, tag = "2")]
        pub message: ::prost::alloc::string::String,
        /// Number of records applied; zero for a replayed batch.
        #[prost(uint32, tag = "3")]
        pub applied: u32,
    }

    include!(concat!(env!("OUT_DIR"), "/tally.MetricService.rs"));
}
