use prometheus::{
    Encoder, GaugeVec, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub commands_total: IntCounterVec,
    pub commands_in_queue: IntGauge,
    pub command_latency_seconds: HistogramVec,
    pub planning_fallbacks_total: IntCounter,
    pub drone_battery_percent: GaugeVec,
    pub telemetry_connections: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let commands_total = IntCounterVec::new(
            Opts::new("commands_total", "Total commands by terminal outcome"),
            &["outcome"],
        )
        .expect("valid commands_total metric");

        let commands_in_queue =
            IntGauge::new("commands_in_queue", "Current number of queued commands")
                .expect("valid commands_in_queue metric");

        let command_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "command_latency_seconds",
                "Time from enqueue to terminal state in seconds",
            ),
            &["outcome"],
        )
        .expect("valid command_latency_seconds metric");

        let planning_fallbacks_total = IntCounter::new(
            "planning_fallbacks_total",
            "Paths that fell back to the direct route after failed avoidance",
        )
        .expect("valid planning_fallbacks_total metric");

        let drone_battery_percent = GaugeVec::new(
            Opts::new("drone_battery_percent", "Last reported battery level [0..100]"),
            &["drone_id"],
        )
        .expect("valid drone_battery_percent metric");

        let telemetry_connections = IntGaugeVec::new(
            Opts::new("telemetry_connections", "Telemetry connections by state"),
            &["state"],
        )
        .expect("valid telemetry_connections metric");

        registry
            .register(Box::new(commands_total.clone()))
            .expect("register commands_total");
        registry
            .register(Box::new(commands_in_queue.clone()))
            .expect("register commands_in_queue");
        registry
            .register(Box::new(command_latency_seconds.clone()))
            .expect("register command_latency_seconds");
        registry
            .register(Box::new(planning_fallbacks_total.clone()))
            .expect("register planning_fallbacks_total");
        registry
            .register(Box::new(drone_battery_percent.clone()))
            .expect("register drone_battery_percent");
        registry
            .register(Box::new(telemetry_connections.clone()))
            .expect("register telemetry_connections");

        Self {
            registry,
            commands_total,
            commands_in_queue,
            command_latency_seconds,
            planning_fallbacks_total,
            drone_battery_percent,
            telemetry_connections,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
