use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;

use voxduplex::audio::AlsaBackend;
use voxduplex::config::Config;
use voxduplex::controller::{ControlCommand, SessionController};
use voxduplex::net_link::WebSocketTransport;
use voxduplex::state_machine::SessionState;
use voxduplex::volume::{VolumeObserver, VolumeState};

fn parse_command(line: &str) -> Option<ControlCommand> {
    let mut words = line.split_whitespace();
    match words.next()? {
        "connect" => Some(ControlCommand::Connect),
        "disconnect" => Some(ControlCommand::Disconnect),
        "quit" | "exit" => Some(ControlCommand::Shutdown),
        "pitch" => words
            .next()
            .and_then(|cents| cents.parse::<f32>().ok())
            .map(ControlCommand::SetPitch),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = Config::new().map_err(|e| anyhow!(e))?;
    log::info!(
        "{} v{} starting, model={}, input={} Hz, output={} Hz",
        env!("APP_NAME"),
        env!("APP_VERSION"),
        config.model,
        config.audio.input_sample_rate,
        config.audio.output_sample_rate
    );

    // 音量观察者：由前端负责衰减
    let levels = Arc::new(Mutex::new(VolumeState::default()));
    let levels_sink = levels.clone();
    let observer: VolumeObserver = Arc::new(move |input, output| {
        if let Ok(mut state) = levels_sink.lock() {
            state.observe(input, output);
        }
    });

    let devices = AlsaBackend::new(config.audio.clone(), config.playback.pitch_window);
    let controller = SessionController::new(
        config,
        Box::new(devices),
        Arc::new(WebSocketTransport),
        observer,
    );
    let mut status = controller.subscribe();

    // 控制命令通道
    let (tx_cmd, rx_cmd) = mpsc::channel::<ControlCommand>(16);
    let controller_task = tokio::spawn(controller.run(rx_cmd));

    // 启动即连接
    tx_cmd.send(ControlCommand::Connect).await?;
    println!("Commands: connect | disconnect | pitch <cents> | quit");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut meter = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }

            line = stdin.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => match parse_command(&line) {
                        Some(ControlCommand::Shutdown) => break,
                        Some(cmd) => {
                            if tx_cmd.send(cmd).await.is_err() {
                                log::error!("Session controller is gone");
                                break;
                            }
                        }
                        None if line.trim().is_empty() => {}
                        None => println!("Unknown command: {}", line.trim()),
                    },
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        log::warn!("Failed to read stdin: {}", e);
                        stdin_open = false;
                    }
                }
            }

            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                match current.error {
                    Some(message) => println!("Session {}: {}", current.state, message),
                    None => println!("Session {}", current.state),
                }
            }

            _ = meter.tick() => {
                let connected = status.borrow().state == SessionState::Connected;
                if connected {
                    if let Ok(levels) = levels.lock() {
                        log::debug!("Levels: in={:.3} out={:.3}", levels.input, levels.output);
                    }
                }
                if let Ok(mut levels) = levels.lock() {
                    levels.observe(0.0, 0.0);
                }
            }
        }
    }

    let _ = tx_cmd.send(ControlCommand::Shutdown).await;
    if let Err(e) = controller_task.await {
        log::error!("Session controller task failed: {}", e);
    }
    Ok(())
}
