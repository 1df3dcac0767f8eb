use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use lettre::message::Mailbox;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use gateway_server::config::{OutputConfig, PlcConfig, Settings};
use gateway_server::drivers::database::DatabaseDriver;
use gateway_server::drivers::modbus::ModbusDriver;
use gateway_server::drivers::opcua::OpcUaDriver;
use gateway_server::drivers::Driver;
use gateway_server::ensemble::Ensemble;
use gateway_server::logging;
use gateway_server::outputs::{DatabaseOutput, FileOutput, LogOutput, MailOutput, Output};
use gateway_server::server;

#[tokio::main]
async fn main() {
    logging::init_logging(None);

    let config_path = std::path::Path::new("config.toml");
    let settings = match Settings::load(config_path) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, path = %config_path.display(), "failed to load configuration");
            std::process::exit(1);
        }
    };

    let ensemble = Arc::new(Ensemble::new());

    for plc in &settings.plcs {
        let driver: Arc<dyn Driver> = match build_driver(plc) {
            Ok(d) => d,
            Err(e) => {
                error!(plc = %plc.key(), error = %e, "failed to build driver, skipping");
                continue;
            }
        };
        ensemble.add_plc(plc.key(), driver);
    }

    for cfg in &settings.tag_import {
        match ensemble.import_tags(&cfg.filename, cfg) {
            Ok(n) => info!(file = %cfg.filename, count = n, "imported tags"),
            Err(e) => error!(file = %cfg.filename, error = %e, "failed to import tags"),
        }
    }

    for cfg in &settings.alarm_import {
        match ensemble.import_alarms(&cfg.filename, cfg) {
            Ok(n) => info!(file = %cfg.filename, group = %cfg.alarmgroup, count = n, "imported alarms"),
            Err(e) => error!(file = %cfg.filename, error = %e, "failed to import alarms"),
        }
    }

    for output in &settings.outputs {
        if let Err(e) = wire_output(&ensemble, output).await {
            error!(error = %e, "failed to wire output, skipping");
        }
    }

    ensemble.deploy().await;

    let http = {
        let ensemble = ensemble.clone();
        let server_cfg = settings.server.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve_http(ensemble, &server_cfg).await {
                error!(error = %e, "http server exited");
            }
        })
    };

    let ws = {
        let ensemble = ensemble.clone();
        let server_cfg = settings.server.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve_ws(ensemble, &server_cfg).await {
                error!(error = %e, "websocket server exited");
            }
        })
    };

    tokio::select! {
        _ = http => {}
        _ = ws => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }
}

fn build_driver(plc: &PlcConfig) -> Result<Arc<dyn Driver>, String> {
    match plc {
        PlcConfig::Modbus {
            key, host, port, unit_id, connect_retry_attempts, ..
        } => {
            let addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .map_err(|e| format!("invalid modbus address: {e}"))?;
            Ok(Arc::new(ModbusDriver::new(
                key.clone(),
                addr,
                *unit_id,
                *connect_retry_attempts,
                plc.poll_interval(),
            )))
        }
        PlcConfig::Opcua {
            key, host, port, publishing_interval_ms, ..
        } => {
            let endpoint_url = format!("opc.tcp://{host}:{port}");
            Ok(Arc::new(OpcUaDriver::new(
                key.clone(),
                endpoint_url,
                *publishing_interval_ms,
                plc.poll_interval(),
            )))
        }
        PlcConfig::Database { key, dsn, .. } => Ok(Arc::new(DatabaseDriver::new(
            key.clone(),
            dsn.clone(),
            plc.poll_interval(),
        ))),
    }
}

async fn wire_output(ensemble: &Arc<Ensemble>, cfg: &OutputConfig) -> Result<(), String> {
    match cfg {
        OutputConfig::Log { alarmgroup } => {
            let group = ensemble.alarms.get_or_create(alarmgroup);
            group.add_output(Arc::new(LogOutput) as Arc<dyn Output>);
        }
        OutputConfig::File { alarmgroup, path } => {
            let group = ensemble.alarms.get_or_create(alarmgroup);
            group.add_output(Arc::new(FileOutput::new(path.clone())) as Arc<dyn Output>);
        }
        OutputConfig::Database { alarmgroup, dsn, table } => {
            let pool = PgPoolOptions::new()
                .max_connections(4)
                .connect(dsn)
                .await
                .map_err(|e| format!("connecting database output: {e}"))?;
            let output = DatabaseOutput::new(pool, table.clone(), "ts", "description", "value");
            let group = ensemble.alarms.get_or_create(alarmgroup);
            group.add_output(Arc::new(output) as Arc<dyn Output>);
        }
        OutputConfig::Mail {
            alarmgroup,
            smtp_host,
            smtp_port: _smtp_port,
            username,
            password,
            from,
            to,
        } => {
            // lettre's relay() picks the implicit-TLS port; MailOutput has no per-port override
            let from = Mailbox::from_str(from).map_err(|e| format!("invalid 'from' address: {e}"))?;
            let to = vec![Mailbox::from_str(to).map_err(|e| format!("invalid 'to' address: {e}"))?];
            let output = MailOutput::new(
                smtp_host,
                Some(username.clone()),
                Some(password.clone()),
                from,
                to,
                None,
            )
            .map_err(|e| format!("building mail transport: {e}"))?;
            let group = ensemble.alarms.get_or_create(alarmgroup);
            group.add_output(Arc::new(output) as Arc<dyn Output>);
        }
    }
    Ok(())
}
