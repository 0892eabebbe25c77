use plcsim::channel::{ChannelBank, MockIo};
use plcsim::protocol::{ServerCommand, ServerResponse};
use plcsim::scheduler::{Simulator, SimulatorConfig};
use plcsim::topology::{TopologyFile, TopologyManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

const TCP_PORT: u16 = 8090;
const SNAPSHOT_BROADCAST_BUFFER_SIZE: usize = 256;

struct SimServer {
    sim: Simulator,
    manager: TopologyManager,
    mock: MockIo,
    running: bool,
    paused: bool,
}

impl SimServer {
    fn new(manager: TopologyManager) -> Self {
        let mock = MockIo::new();
        let bank = ChannelBank::new(Box::new(mock.clone()));
        let sim = Simulator::new(bank, manager.current(), SimulatorConfig::default());
        Self {
            sim,
            manager,
            mock,
            running: true,
            paused: false,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("🏭 PLC Instrument Simulator");
    println!("===========================");

    let mut manager = TopologyManager::new();
    if let Some(path) = std::env::args().nth(1) {
        let raw = std::fs::read_to_string(&path)?;
        let file: TopologyFile = serde_json::from_str(&raw)?;
        let topology = manager.replace(file.instruments)?;
        info!(
            path = %path,
            instruments = topology.len(),
            "topology loaded"
        );
    } else {
        info!("no topology file given; starting empty");
    }

    let server = Arc::new(Mutex::new(SimServer::new(manager)));

    let (snapshot_tx, _) = broadcast::channel::<String>(SNAPSHOT_BROADCAST_BUFFER_SIZE);

    let tcp_server_state = Arc::clone(&server);
    let tcp_snapshot_tx = snapshot_tx.clone();
    let tcp_server = tokio::spawn(async move {
        if let Err(e) = start_tcp_server(tcp_server_state, tcp_snapshot_tx).await {
            error!("TCP server error: {}", e);
        }
    });

    let interval_ms = {
        let server_guard = server.lock().await;
        server_guard.sim.tick_interval_ms()
    };
    let mut interval = time::interval(Duration::from_millis(interval_ms));
    // Overruns reschedule immediately instead of skipping ticks.
    interval.set_missed_tick_behavior(MissedTickBehavior::Burst);

    loop {
        interval.tick().await;

        let (snapshot, running) = {
            let mut server_guard = server.lock().await;
            let snapshot = if server_guard.paused {
                None
            } else {
                Some(server_guard.sim.tick())
            };
            (snapshot, server_guard.running)
        };

        if let Some(snapshot) = snapshot {
            if snapshot_tx.receiver_count() > 0 {
                let line = serde_json::to_string(&ServerResponse::Snapshot {
                    snapshot: (*snapshot).clone(),
                })?;
                if let Err(e) = snapshot_tx.send(line) {
                    warn!("failed to broadcast snapshot: {}", e);
                }
            }
        }

        if !running {
            break;
        }
    }

    tcp_server.abort();
    println!("🏭 PLC Instrument Simulator stopped");

    Ok(())
}

async fn start_tcp_server(
    server: Arc<Mutex<SimServer>>,
    snapshot_tx: broadcast::Sender<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", TCP_PORT)).await?;
    info!("🌐 TCP server listening on port {}", TCP_PORT);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("🔗 new client connected: {}", addr);
                let client_state = Arc::clone(&server);
                let client_snapshot_rx = snapshot_tx.subscribe();

                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_state, client_snapshot_rx).await {
                        warn!("client {} error: {}", addr, e);
                    }
                    info!("🔌 client {} disconnected", addr);
                });
            }
            Err(e) => {
                error!("failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    server: Arc<Mutex<SimServer>>,
    mut snapshot_rx: broadcast::Receiver<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let writer = Arc::new(Mutex::new(writer));

    // Stream every published snapshot to this client.
    let snapshot_writer = Arc::clone(&writer);
    let snapshot_task = tokio::spawn(async move {
        while let Ok(line) = snapshot_rx.recv().await {
            let mut writer_guard = snapshot_writer.lock().await;
            if writer_guard.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if writer_guard.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    let mut line = String::new();
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let response = match serde_json::from_str::<ServerCommand>(trimmed) {
                    Ok(command) => {
                        info!("📨 command: {:?}", command);
                        let mut server_guard = server.lock().await;
                        execute(&mut server_guard, command)
                    }
                    Err(e) => ServerResponse::error(format!("invalid command: {}", e)),
                };

                let response_json = serde_json::to_string(&response)?;
                {
                    let mut writer_guard = writer.lock().await;
                    writer_guard.write_all(response_json.as_bytes()).await?;
                    writer_guard.write_all(b"\n").await?;
                }
            }
            Err(e) => {
                error!("error reading from client: {}", e);
                break;
            }
        }
    }

    snapshot_task.abort();
    Ok(())
}

fn execute(server: &mut SimServer, command: ServerCommand) -> ServerResponse {
    match command {
        ServerCommand::Snapshot => ServerResponse::Snapshot {
            snapshot: (*server.sim.snapshot()).clone(),
        },
        ServerCommand::Stats => ServerResponse::Stats {
            stats: server.sim.stats(),
        },
        ServerCommand::ListInstruments => ServerResponse::Instruments {
            records: server.manager.records().to_vec(),
        },
        ServerCommand::SetDigitalInput { address, value } => {
            server.mock.set_digital_input(address, value);
            ServerResponse::ok()
        }
        ServerCommand::SetAnalogInput { address, value } => {
            if !(0.0..=1.0).contains(&value) {
                return ServerResponse::error("analog value must be within 0.0..=1.0");
            }
            server.mock.set_analog_input(address, value);
            ServerResponse::ok()
        }
        ServerCommand::AddInstrument { record } => {
            apply_topology(server, |server| server.manager.add(record))
        }
        ServerCommand::UpdateInstrument { record } => {
            apply_topology(server, |server| server.manager.update(record))
        }
        ServerCommand::RemoveInstrument { id } => {
            apply_topology(server, |server| server.manager.remove(&id))
        }
        ServerCommand::ReplaceTopology { records } => {
            apply_topology(server, |server| server.manager.replace(records))
        }
        ServerCommand::Start => {
            if server.paused {
                server.paused = false;
                info!("simulation resumed");
            }
            ServerResponse::ok_with("running")
        }
        ServerCommand::Stop => {
            if !server.paused {
                server.paused = true;
                info!("simulation paused");
            }
            ServerResponse::ok_with("paused")
        }
        ServerCommand::Shutdown => {
            server.running = false;
            ServerResponse::ok_with("shutting down")
        }
    }
}

fn apply_topology<F>(server: &mut SimServer, edit: F) -> ServerResponse
where
    F: FnOnce(&mut SimServer) -> Result<Arc<plcsim::Topology>, plcsim::ConfigError>,
{
    match edit(server) {
        Ok(topology) => {
            let generation = topology.generation();
            server.sim.submit_topology(topology);
            ServerResponse::ok_with(format!("generation {} pending", generation))
        }
        Err(e) => ServerResponse::error(e.to_string()),
    }
}
