fn main() {
    let update_batch = tonic_build::manual::Method::builder()
        .name("update_batch")
        .route_name("UpdateBatch")
        .input_type("crate::proto::MetricBatchProto")
        .output_type("crate::proto::UpdateBatchResponse")
        .codec_path("tonic::codec::ProstCodec")
        .build();

    let service = tonic_build::manual::Service::builder()
        .name("MetricService")
        .package("tally")
        .method(update_batch)
        .build();

    tonic_build::manual::Builder::new().compile(&[service]);
}
