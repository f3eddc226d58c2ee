//! loadstorm: controlled concurrent load against HTTP(S) and WebSocket
//! endpoints, with real-time latency and throughput statistics.
//!
//! The engine lives in [`loadtest`]. A run is driven by a
//! [`TestPlan`](loadtest::config::TestPlan) and a
//! [`WorkflowDefinition`](loadtest::workflow::WorkflowDefinition):
//!
//! ```no_run
//! use loadstorm::loadtest::config::TestPlan;
//! use loadstorm::loadtest::engine::LoadTestEngine;
//! use loadstorm::loadtest::workflow::WorkflowDefinition;
//!
//! # async fn demo() -> Result<(), loadstorm::loadtest::error::LoadTestError> {
//! let plan = TestPlan::for_url("http://localhost:8080/health");
//! let workflow = WorkflowDefinition::single_url(&plan)?;
//! let result = LoadTestEngine::new(plan, workflow).run().await?;
//! println!("p95 = {:.1}ms", result.snapshot.latency.p95_ms);
//! # Ok(())
//! # }
//! ```

pub mod loadtest;
