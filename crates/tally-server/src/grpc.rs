use crate::ingest::{run_blocking, IngestError};
use crate::state::AppState;
use std::net::IpAddr;
use tally_common::proto::metric_service_server::MetricService;
use tally_common::proto::{MetricBatchProto, UpdateBatchResponse};
use tally_common::types::MetricRecord;
use tonic::{Request, Response, Status};

/// Wire count of applied records, saturating at `u32::MAX`.
fn applied_count(applied: usize) -> u32 {
    u32::try_from(applied).unwrap_or(u32::MAX)
}

pub struct MetricServiceImpl {
    state: AppState,
}

impl MetricServiceImpl {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    fn check_subnet<T>(&self, request: &Request<T>) -> Result<(), Status> {
        let Some(subnet) = self.state.trusted_subnet else {
            return Ok(());
        };
        let ip: Option<IpAddr> = request
            .metadata()
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        match ip {
            Some(ip) if subnet.contains(ip) => Ok(()),
            ip => {
                tracing::warn!(real_ip = ?ip, "gRPC batch rejected: address outside trusted subnet");
                Err(Status::permission_denied(
                    "address is not in the trusted subnet",
                ))
            }
        }
    }
}

#[tonic::async_trait]
impl MetricService for MetricServiceImpl {
    async fn update_batch(
        &self,
        request: Request<MetricBatchProto>,
    ) -> Result<Response<UpdateBatchResponse>, Status> {
        self.check_subnet(&request)?;
        let proto = request.into_inner();

        let records = proto
            .metrics
            .iter()
            .enumerate()
            .map(|(index, m)| {
                MetricRecord::try_from(m)
                    .map_err(|e| IngestError::Client(format!("record {index}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let batch_id = proto.batch_id;
        let outcome = run_blocking(self.state.ingest.clone(), move |ingest| {
            ingest.update_batch(Some(batch_id.as_str()), &records)
        })
        .await?;

        tracing::debug!(
            applied = outcome.applied,
            duplicate = outcome.duplicate,
            "gRPC batch ingested"
        );

        Ok(Response::new(UpdateBatchResponse {
            success: true,
            message: if outcome.duplicate { "duplicate" } else { "ok" }.to_string(),
            applied: applied_count(outcome.applied),
        }))
    }
}
