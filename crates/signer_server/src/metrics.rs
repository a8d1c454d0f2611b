// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

static TOTAL_REQUESTS_NAME: &str = "signer_total_requests";
static TOTAL_REQUESTS_DESCRIPTION: &str = "Total number of RPC requests received since last start";

static CODED_FAULTS_NAME: &str = "signer_coded_faults";
static CODED_FAULTS_DESCRIPTION: &str =
    "Total number of RPC requests that failed with a coded fault since last start";

static UNEXPECTED_FAILURES_NAME: &str = "signer_unexpected_failures";
static UNEXPECTED_FAILURES_DESCRIPTION: &str =
    "Total number of RPC requests that failed unexpectedly since last start";

static BAD_REQUESTS_NAME: &str = "signer_bad_requests";
static BAD_REQUESTS_DESCRIPTION: &str =
    "Total number of rejected / malformed requests since last start";

static IN_FLIGHT_NAME: &str = "signer_requests_in_flight";
static IN_FLIGHT_DESCRIPTION: &str = "Current number of RPC requests being processed";

static MAX_CONNECTIONS_NAME: &str = "signer_max_connections";
static MAX_CONNECTIONS_DESCRIPTION: &str =
    "Maximum number of main plane connections that can be served concurrently";

pub struct SignerMetrics {
    registry: Registry,
    pub requests: IntCounter,
    pub coded_faults: IntCounter,
    pub unexpected_failures: IntCounter,
    pub bad_requests: IntCounter,
    in_flight: IntGauge,
    pub max_connections: IntGauge,
}

impl SignerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let requests = counter(TOTAL_REQUESTS_NAME, TOTAL_REQUESTS_DESCRIPTION)?;
        let coded_faults = counter(CODED_FAULTS_NAME, CODED_FAULTS_DESCRIPTION)?;
        let unexpected_failures = counter(UNEXPECTED_FAILURES_NAME, UNEXPECTED_FAILURES_DESCRIPTION)?;
        let bad_requests = counter(BAD_REQUESTS_NAME, BAD_REQUESTS_DESCRIPTION)?;

        let in_flight = IntGauge::new(IN_FLIGHT_NAME, IN_FLIGHT_DESCRIPTION)?;
        registry.register(Box::new(in_flight.clone()))?;
        let max_connections = IntGauge::new(MAX_CONNECTIONS_NAME, MAX_CONNECTIONS_DESCRIPTION)?;
        registry.register(Box::new(max_connections.clone()))?;

        Ok(Self {
            registry,
            requests,
            coded_faults,
            unexpected_failures,
            bad_requests,
            in_flight,
            max_connections,
        })
    }

    /// Returns a guard that counts one in-flight request until it is dropped.
    pub fn in_flight(&self) -> RAIIGauge {
        RAIIGauge::new(&self.in_flight)
    }

    pub fn in_flight_count(&self) -> i64 {
        self.in_flight.get()
    }

    /// Renders every metric in the Prometheus text format.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = vec![];
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub struct RAIIGauge {
    metric: IntGauge,
}

impl RAIIGauge {
    pub fn new(gauge: &IntGauge) -> RAIIGauge {
        gauge.inc();
        RAIIGauge {
            metric: gauge.clone(),
        }
    }
}

impl Drop for RAIIGauge {
    fn drop(&mut self) {
        self.metric.dec();
    }
}
