use anyhow::{bail, Result};
use jbdbms_lib::client::JbdBms;
use jbdbms_lib::protocol;
use jbdbms_lib::serialport::SerialTransport;
use log::{error, info, warn};
use serde_json::json;
use std::collections::HashMap;

use crate::{commandline, mqtt};

type Bms = JbdBms<SerialTransport>;

#[derive(Debug)]
enum FetchedData {
    Status(protocol::Status),
    Cells(protocol::Cells),
    Hardware(protocol::Hardware),
    Balancing(String),
}

impl FetchedData {
    fn to_json_value(&self) -> Result<serde_json::Value> {
        match self {
            FetchedData::Status(s) => serde_json::to_value(s).map_err(Into::into),
            FetchedData::Cells(s) => serde_json::to_value(s).map_err(Into::into),
            FetchedData::Hardware(s) => serde_json::to_value(s).map_err(Into::into),
            FetchedData::Balancing(s) => serde_json::to_value(s).map_err(Into::into),
        }
    }

    fn as_debug_string(&self) -> String {
        match self {
            FetchedData::Status(s) => format!("{s:?}"),
            FetchedData::Cells(s) => format!("{s:?}"),
            FetchedData::Hardware(s) => format!("{s:?}"),
            FetchedData::Balancing(s) => s.clone(),
        }
    }
}

type Fetch = Box<dyn Fn(&mut Bms) -> Result<FetchedData>>;

// Every JBD read is self-contained, so no metric depends on another being
// fetched first.
fn get_metrics<'a>() -> HashMap<&'a str, Fetch> {
    let mut metrics: HashMap<&'a str, Fetch> = HashMap::new();
    metrics.insert(
        "status",
        Box::new(|bms| Ok(bms.get_status().map(FetchedData::Status)?)),
    );
    metrics.insert(
        "cells",
        Box::new(|bms| Ok(bms.get_cells().map(FetchedData::Cells)?)),
    );
    metrics.insert(
        "hardware",
        Box::new(|bms| Ok(bms.get_hardware().map(FetchedData::Hardware)?)),
    );
    metrics.insert(
        "balancing",
        Box::new(|bms| {
            let status = bms.get_status()?;
            Ok(FetchedData::Balancing(status.balance_text()))
        }),
    );
    metrics
}

fn publish_simple_format(
    publisher: &mqtt::MqttPublisher,
    base_topic: &str,
    metric_name: &str,
    value: &serde_json::Value,
) {
    fn publish_recursive(publisher: &mqtt::MqttPublisher, topic: &str, val: &serde_json::Value) {
        match val {
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    let sub_topic = format!("{topic}/{k}");
                    publish_recursive(publisher, &sub_topic, v);
                }
            }
            serde_json::Value::Array(arr) => {
                for (i, v) in arr.iter().enumerate() {
                    let sub_topic = format!("{topic}/{i}");
                    publish_recursive(publisher, &sub_topic, v);
                }
            }
            serde_json::Value::String(s) => {
                if let Err(e) = publisher.publish(topic, s) {
                    error!("Failed to publish message to topic {topic}: {e}");
                }
            }
            serde_json::Value::Number(n) => {
                if let Err(e) = publisher.publish(topic, &n.to_string()) {
                    error!("Failed to publish message to topic {topic}: {e}");
                }
            }
            serde_json::Value::Bool(b) => {
                if let Err(e) = publisher.publish(topic, &b.to_string()) {
                    error!("Failed to publish message to topic {topic}: {e}");
                }
            }
            serde_json::Value::Null => {
                // Do not publish null values
            }
        }
    }
    let root_topic = format!("{base_topic}/{metric_name}");
    publish_recursive(publisher, &root_topic, value);
}

pub fn run(
    mut bms: Bms,
    output: commandline::DaemonOutput,
    interval: std::time::Duration,
    metrics_to_fetch: Vec<String>,
) -> Result<()> {
    info!(
        "Starting daemon mode: output={output:?}, interval={interval:?}, metrics={metrics_to_fetch:?}"
    );
    let available_metrics = get_metrics();

    let mut mqtt_publisher: Option<mqtt::MqttPublisher> = None;

    if let commandline::DaemonOutput::Mqtt { config_file, .. } = &output {
        let config = mqtt::MqttConfig::load(config_file)?;
        info!("Successfully loaded MQTT config from {config_file}");
        let publisher = mqtt::MqttPublisher::new(config)?;
        mqtt_publisher = Some(publisher);
    }

    loop {
        let mut fetched_data: HashMap<String, FetchedData> = HashMap::new();
        let mut metrics_to_process = metrics_to_fetch.clone();

        if metrics_to_process.iter().any(|m| m == "all") {
            info!("Fetching all metrics due to 'all' flag.");
            metrics_to_process = available_metrics.keys().map(|s| s.to_string()).collect();
        }

        for metric_name in &metrics_to_process {
            if let Some(fetch) = available_metrics.get(metric_name.as_str()) {
                info!("Fetching metric: {metric_name}");
                match fetch(&mut bms) {
                    Ok(data) => {
                        fetched_data.insert(metric_name.to_string(), data);
                    }
                    Err(e) => error!("Error fetching metric '{metric_name}': {e}"),
                }
            } else {
                bail!("Unknown metric name '{}'", metric_name);
            }
        }

        match &output {
            commandline::DaemonOutput::Console => {
                println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
                for (name, data) in &fetched_data {
                    println!("{}: {}", name, data.as_debug_string());
                }
                println!("--------------------------");
            }
            commandline::DaemonOutput::Mqtt { format, .. } => {
                if let Some(publisher) = &mqtt_publisher {
                    match format {
                        commandline::MqttFormat::Json => {
                            let mut data_to_publish = serde_json::Map::new();
                            data_to_publish.insert(
                                "timestamp".to_string(),
                                json!(chrono::Utc::now().to_rfc3339()),
                            );

                            for (name, data) in &fetched_data {
                                match data.to_json_value() {
                                    Ok(val) => {
                                        data_to_publish.insert(name.clone(), val);
                                    }
                                    Err(e) => error!("Failed to serialize '{name}': {e}"),
                                }
                            }

                            if data_to_publish.len() > 1 {
                                match serde_json::to_string(&data_to_publish) {
                                    Ok(json_payload) => {
                                        if let Err(e) =
                                            publisher.publish(publisher.topic(), &json_payload)
                                        {
                                            error!("Failed to publish data to MQTT: {e:?}");
                                        }
                                    }
                                    Err(e) => {
                                        error!("Failed to serialize data to JSON string: {e}");
                                    }
                                }
                            } else {
                                info!("No data fetched in this cycle to publish via MQTT.");
                            }
                        }
                        commandline::MqttFormat::Simple => {
                            let base_topic = publisher.topic();
                            for (name, data) in &fetched_data {
                                match data.to_json_value() {
                                    Ok(value) => {
                                        publish_simple_format(publisher, base_topic, name, &value);
                                    }
                                    Err(e) => error!("Failed to serialize '{name}': {e}"),
                                }
                            }
                        }
                    }
                } else {
                    warn!(
                        "MQTT output selected, but publisher is not initialized. Skipping publish."
                    );
                }
            }
        }
        std::thread::sleep(interval);
    }
}
