/*
 * Copyright (c) 2024-2025 Elide Technologies, Inc.
 *
 * Licensed under the MIT license (the "License"); you may not use this file except in compliance
 * with the License. You may obtain a copy of the License at
 *
 *   https://opensource.org/license/mit/
 *
 * Unless required by applicable law or agreed to in writing, software distributed under the License is distributed on
 * an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. See the
 * License for the specific language governing permissions and limitations under the License.
 */

//! Per-service composition of workers and proxies.
//!
//! Each service type spawns its `wfb_rx`/`wfb_tx` workers and wires the user-space proxies
//! between them. When a TX worker is involved, the builder waits for the worker's ephemeral
//! per-NIC port announcements, allocates one forwarding proxy per NIC, and registers an
//! antenna-selection callback that re-points the inbound proxy at the selected NIC's
//! forwarder. Any constituent failing tears the whole service down.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{info, warn};

use base::peer::PeerUri;
use base::records::StatsRecord;
use proxy::fanout::MavlinkTcpFanout;
use proxy::mav::{ArmDetector, MavHook, MavlinkOpts, MavlinkUdpProxy, RssiReport};
use proxy::serial::MavlinkSerialProxy;
use proxy::tun::{TunOpts, TunTapProxy};
use proxy::udp::UdpProxy;
use proxy::PacketSender;
use stats::agg::Aggregator;
use supervisor::{RxWorker, TxWorker};
use telemetry::rx::RxEvent;
use telemetry::tx::TxEvent;

use crate::config::{Common, Paths, ServiceType, Stream};
use crate::ServiceError;

/// SIGTERM-to-SIGKILL grace when stopping a worker.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

/// Everything a service shares with its profile.
#[derive(Clone)]
pub struct ServiceCtx {
  pub wlans: Vec<String>,
  pub link_id: u32,
  pub agg: Aggregator,
  pub common: Arc<Common>,
  pub paths: Arc<Paths>,
  pub binlog: Option<std::sync::mpsc::SyncSender<Bytes>>,
  pub shutdown: watch::Receiver<bool>,
}

/// Run one service to completion (worker exit, failure, or orchestrated shutdown).
pub async fn run_service(name: &str, cfg: &Stream, ctx: ServiceCtx) -> Result<(), ServiceError> {
  match cfg.service_type {
    ServiceType::UdpDirectRx => run_udp_direct_rx(name, cfg, ctx).await,
    ServiceType::UdpDirectTx => run_udp_direct_tx(name, cfg, ctx).await,
    ServiceType::Mavlink => run_mavlink(name, cfg, ctx).await,
    ServiceType::Tunnel => run_tunnel(name, cfg, ctx).await,
    ServiceType::UdpProxy => run_udp_proxy(name, cfg, ctx).await,
  }
}

fn parse_peer(name: &str, peer: &str) -> Result<PeerUri, ServiceError> {
  peer
    .parse()
    .map_err(|_| ServiceError::Config(format!("{name}: unsupported peer address: {peer}")))
}

fn require_stream(name: &str, key: &str, value: Option<u32>) -> Result<u32, ServiceError> {
  value.ok_or_else(|| ServiceError::Config(format!("{name}: {key} is required")))
}

fn keyfile(paths: &Paths, cfg: &Stream) -> String {
  paths.conf_dir.join(&cfg.keypair).display().to_string()
}

/// `wfb_rx -p <stream> [-c <addr> -u <port>] | [-u <port>] -K <key> -i <link_id> <wlan…>`
fn rx_cmd(
  ctx: &ServiceCtx,
  cfg: &Stream,
  stream: u32,
  local_port: Option<u16>,
  connect: Option<SocketAddrV4>,
) -> Vec<String> {
  let mut cmd = vec![
    ctx.paths.bin_dir.join("wfb_rx").display().to_string(),
    "-p".to_string(),
    stream.to_string(),
  ];
  if let Some(addr) = connect {
    cmd.extend(["-c".to_string(), addr.ip().to_string(), "-u".to_string(), addr.port().to_string()]);
  } else if let Some(port) = local_port {
    cmd.extend(["-u".to_string(), port.to_string()]);
  }
  cmd.extend([
    "-K".to_string(),
    keyfile(&ctx.paths, cfg),
    "-i".to_string(),
    ctx.link_id.to_string(),
  ]);
  cmd.extend(ctx.wlans.iter().cloned());
  cmd
}

/// The full `wfb_tx` argv per the worker's schema; `input_port` 0 asks the worker to bind an
/// ephemeral input per NIC and announce them back.
fn tx_cmd(ctx: &ServiceCtx, cfg: &Stream, stream: u32, input_port: u16, wlans: &[String]) -> Vec<String> {
  let mut cmd = vec![
    ctx.paths.bin_dir.join("wfb_tx").display().to_string(),
    "-f".to_string(),
    cfg.frame_type.clone(),
    "-p".to_string(),
    stream.to_string(),
    "-u".to_string(),
    input_port.to_string(),
    "-K".to_string(),
    keyfile(&ctx.paths, cfg),
    "-B".to_string(),
    cfg.bandwidth.to_string(),
    "-G".to_string(),
    if cfg.short_gi { "short" } else { "long" }.to_string(),
    "-S".to_string(),
    cfg.stbc.to_string(),
    "-L".to_string(),
    cfg.ldpc.to_string(),
    "-M".to_string(),
    cfg.mcs_index.to_string(),
  ];
  if cfg.mirror {
    cmd.push("-m".to_string());
  }
  if cfg.force_vht {
    cmd.push("-V".to_string());
  }
  if cfg.use_qdisc {
    cmd.extend(["-Q".to_string(), "-P".to_string(), cfg.fwmark.to_string()]);
  }
  cmd.extend([
    "-k".to_string(),
    cfg.fec_k.to_string(),
    "-n".to_string(),
    cfg.fec_n.to_string(),
    "-T".to_string(),
    cfg.fec_timeout.to_string(),
    "-F".to_string(),
    cfg.fec_delay.to_string(),
    "-i".to_string(),
    ctx.link_id.to_string(),
    "-R".to_string(),
    ctx.common.tx_rcv_buf_size.to_string(),
    "-C".to_string(),
    cfg.control_port.to_string(),
  ]);
  cmd.extend(wlans.iter().cloned());
  cmd
}

fn rx_sink(agg: Aggregator, id: String) -> impl FnMut(RxEvent) + Send + 'static {
  move |event| match event {
    RxEvent::Update { packets, ant_stats, session } => {
      agg.update_rx_stats(&id, packets, ant_stats, session)
    }
    RxEvent::NewSession(session) => agg.process_new_session(&id, session),
  }
}

fn tx_sink(agg: Aggregator, id: String) -> impl FnMut(TxEvent) + Send + 'static {
  move |event| {
    if let TxEvent::Update { packets, latency } = event {
      agg.update_tx_stats(&id, packets, latency);
    }
  }
}

async fn wait_tx(worker: &mut Option<TxWorker>, done: bool) -> Result<(), supervisor::WorkerError> {
  match worker.as_mut() {
    Some(worker) if !done => worker.wait().await,
    _ => std::future::pending().await,
  }
}

async fn wait_rx(worker: &mut Option<RxWorker>, done: bool) -> Result<(), supervisor::WorkerError> {
  match worker.as_mut() {
    Some(worker) if !done => worker.wait().await,
    _ => std::future::pending().await,
  }
}

/// Drive the service's workers until all exit cleanly, one fails, or shutdown is requested.
/// On failure or shutdown every remaining worker is stopped (SIGTERM, grace, SIGKILL).
async fn supervise(
  mut shutdown: watch::Receiver<bool>,
  mut tx: Option<TxWorker>,
  mut rx: Option<RxWorker>,
) -> Result<(), ServiceError> {
  let mut tx_done = tx.is_none();
  let mut rx_done = rx.is_none();

  let result = loop {
    if tx_done && rx_done {
      break Ok(());
    }
    tokio::select! {
      result = wait_tx(&mut tx, tx_done) => match result {
        Ok(()) => tx_done = true,
        Err(err) => break Err(ServiceError::Worker(err)),
      },
      result = wait_rx(&mut rx, rx_done) => match result {
        Ok(()) => rx_done = true,
        Err(err) => break Err(ServiceError::Worker(err)),
      },
      changed = shutdown.changed() => {
        if changed.is_err() || *shutdown.borrow() {
          break Ok(());
        }
      },
    }
  };

  if let Some(mut worker) = tx {
    if !tx_done {
      worker.stop(STOP_GRACE).await;
    }
  }
  if let Some(mut worker) = rx {
    if !rx_done {
      worker.stop(STOP_GRACE).await;
    }
  }
  result
}

async fn run_udp_direct_tx(name: &str, cfg: &Stream, ctx: ServiceCtx) -> Result<(), ServiceError> {
  let PeerUri::Listen(listen) = parse_peer(name, &cfg.peer)? else {
    return Err(ServiceError::Config(format!("{name}: unsupported peer address: {}", cfg.peer)));
  };

  // Direct UDP has no TX diversity: without mirroring only the first card can be used.
  if !cfg.mirror && ctx.wlans.len() > 1 {
    return Err(ServiceError::Config(format!(
      "{name}: udp_direct_tx does not support diversity but multiple cards are selected; use udp_proxy instead"
    )));
  }

  let stream = require_stream(name, "stream_tx", cfg.stream_tx)?;
  info!("listen for {name} stream {stream} on {listen}");

  let wlans = if cfg.mirror { ctx.wlans.clone() } else { ctx.wlans[..1].to_vec() };
  let cmd = tx_cmd(&ctx, cfg, stream, listen.port(), &wlans);
  info!("{name}: {}", cmd.join(" "));

  let id = format!("{name} tx");
  let want_control = cfg.control_port == 0;
  let (mut worker, _ports, control) =
    TxWorker::start(&id, &cmd, &[], want_control, tx_sink(ctx.agg.clone(), id.clone()))?;

  let control_port = match control {
    Some(promise) => match promise.wait().await {
      Ok(port) => port,
      Err(err) => {
        worker.stop(STOP_GRACE).await;
        return Err(err.into());
      }
    },
    None => cfg.control_port,
  };
  info!("{name} uses wfb_tx control port {control_port}");

  supervise(ctx.shutdown, Some(worker), None).await
}

async fn run_udp_direct_rx(name: &str, cfg: &Stream, ctx: ServiceCtx) -> Result<(), ServiceError> {
  let PeerUri::Connect(connect) = parse_peer(name, &cfg.peer)? else {
    return Err(ServiceError::Config(format!("{name}: unsupported peer address: {}", cfg.peer)));
  };

  let stream = require_stream(name, "stream_rx", cfg.stream_rx)?;
  info!("send {name} stream {stream} to {connect}");

  let cmd = rx_cmd(&ctx, cfg, stream, None, Some(connect));
  info!("{name}: {}", cmd.join(" "));

  let id = format!("{name} rx");
  let worker = RxWorker::start(&id, &cmd, &[], rx_sink(ctx.agg.clone(), id.clone()))?;
  supervise(ctx.shutdown, None, Some(worker)).await
}

enum MavProxy {
  Udp(MavlinkUdpProxy),
  Serial(MavlinkSerialProxy),
}

impl MavProxy {
  fn sender(&self) -> PacketSender {
    match self {
      MavProxy::Udp(p) => p.sender(),
      MavProxy::Serial(p) => p.sender(),
    }
  }

  fn peer(&self) -> proxy::PeerCell {
    match self {
      MavProxy::Udp(p) => p.peer(),
      MavProxy::Serial(p) => p.peer(),
    }
  }

  fn rssi_sender(&self) -> tokio::sync::mpsc::Sender<RssiReport> {
    match self {
      MavProxy::Udp(p) => p.rssi_sender(),
      MavProxy::Serial(p) => p.rssi_sender(),
    }
  }
}

fn mav_log_hook(log: std::sync::mpsc::SyncSender<Bytes>, id: String) -> MavHook {
  Box::new(move |frame| {
    let record = StatsRecord::Mavlink {
      timestamp: base::unix_now(),
      id: id.clone(),
      data: frame.to_vec(),
    };
    if let Some(payload) = stats::encode_record(&record) {
      let _ = log.try_send(payload);
    }
  })
}

fn register_ant_sel(agg: &Aggregator, peer: proxy::PeerCell, p_tx_l: &[UdpProxy]) {
  let senders: Vec<PacketSender> = p_tx_l.iter().map(|p| p.sender()).collect();
  agg.add_ant_sel_cb(Box::new(move |idx| {
    let Some(sender) = senders.get(idx) else {
      return Err(format!("selected NIC #{idx} has no forwarder").into());
    };
    peer.set(sender.clone());
    Ok(())
  }));
}

fn register_rssi(agg: &Aggregator, rssi: tokio::sync::mpsc::Sender<RssiReport>) {
  agg.add_rssi_cb(Box::new(move |_id, mav_rssi, errors, fec, flags| {
    match rssi.try_send(RssiReport { rssi: mav_rssi, errors, fec, flags }) {
      Ok(()) | Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => Ok(()),
      Err(_) => Err("rssi consumer is gone".into()),
    }
  }));
}

/// Allocate one forwarding proxy per NIC, pointed at the TX worker's announced input port.
async fn allocate_tx_proxies(
  wlans: &[String],
  tx_ports: &HashMap<String, u16>,
) -> Result<Vec<UdpProxy>, ServiceError> {
  let mut proxies = Vec::with_capacity(wlans.len());
  for wlan in wlans {
    let port = *tx_ports
      .get(wlan)
      .ok_or_else(|| ServiceError::Config(format!("tx worker announced no port for {wlan}")))?;
    let to = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    proxies.push(UdpProxy::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), Some(to)).await?);
  }
  Ok(proxies)
}

fn build_hooks(name: &str, cfg: &Stream, ctx: &ServiceCtx) -> (Vec<MavHook>, Vec<MavHook>) {
  let mut rx_hooks: Vec<MavHook> = Vec::new();
  let mut tx_hooks: Vec<MavHook> = Vec::new();

  if cfg.call_on_arm.is_some() || cfg.call_on_disarm.is_some() {
    let detector =
      Arc::new(Mutex::new(ArmDetector::new(cfg.call_on_arm.clone(), cfg.call_on_disarm.clone())));
    let rx_det = detector.clone();
    rx_hooks.push(Box::new(move |frame| rx_det.lock().unwrap().observe(frame)));
    tx_hooks.push(Box::new(move |frame| detector.lock().unwrap().observe(frame)));
  }

  if cfg.log_messages {
    if let Some(log) = ctx.binlog.clone() {
      rx_hooks.push(mav_log_hook(log.clone(), format!("{name} rx")));
      tx_hooks.push(mav_log_hook(log, format!("{name} tx")));
    }
  }

  (rx_hooks, tx_hooks)
}

async fn run_mavlink(name: &str, cfg: &Stream, ctx: ServiceCtx) -> Result<(), ServiceError> {
  let peer = parse_peer(name, &cfg.peer)?;
  let stream_rx = require_stream(name, "stream_rx", cfg.stream_rx)?;
  let stream_tx = require_stream(name, "stream_tx", cfg.stream_tx)?;

  let osd = match cfg.osd.as_deref().map(|uri| parse_peer(name, uri)) {
    Some(Ok(PeerUri::Connect(addr))) => {
      info!("mirror {name} stream to OSD at {addr}");
      Some(SocketAddr::V4(addr))
    }
    Some(_) => {
      warn!("{name}: osd address is not connect://, ignored");
      None
    }
    None => None,
  };

  let (mut rx_hooks, tx_hooks) = build_hooks(name, cfg, &ctx);

  let fanout = if cfg.mavlink_tcp_port > 0 {
    let fanout =
      MavlinkTcpFanout::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, cfg.mavlink_tcp_port))).await?;
    rx_hooks.push(fanout.hook());
    Some(fanout)
  } else {
    None
  };

  let opts = MavlinkOpts {
    agg_max_size: ctx.common.radio_mtu,
    agg_timeout: Duration::from_secs_f64(ctx.common.mavlink_agg_timeout),
    inject_rssi: cfg.inject_rssi,
    mirror: osd,
    sys_id: cfg.mavlink_sys_id,
    comp_id: cfg.mavlink_comp_id,
    rx_hooks,
    tx_hooks,
  };

  let p_in = match &peer {
    PeerUri::Serial { dev, baud } => {
      info!("open serial port {dev} at {baud}");
      MavProxy::Serial(MavlinkSerialProxy::open(dev, *baud, opts)?)
    }
    PeerUri::Listen(addr) => {
      info!("listen for {name} stream {stream_rx}(RX), {stream_tx}(TX) on {addr}");
      MavProxy::Udp(MavlinkUdpProxy::bind(SocketAddr::V4(*addr), None, opts).await?)
    }
    PeerUri::Connect(addr) => {
      info!("connect {name} stream {stream_rx}(RX), {stream_tx}(TX) to {addr}");
      let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
      MavProxy::Udp(MavlinkUdpProxy::bind(bind, Some(SocketAddr::V4(*addr)), opts).await?)
    }
  };

  // Decoded frames from the air arrive on p_rx and flow back into p_in.
  let p_rx = UdpProxy::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), None).await?;
  p_rx.peer().set(p_in.sender());

  let cmd_rx = rx_cmd(&ctx, cfg, stream_rx, Some(p_rx.local_port()), None);
  let cmd_tx = tx_cmd(&ctx, cfg, stream_tx, 0, &ctx.wlans);
  info!("{name} RX: {}", cmd_rx.join(" "));
  info!("{name} TX: {}", cmd_tx.join(" "));

  let tx_id = format!("{name} tx");
  let want_control = cfg.control_port == 0;
  let (mut tx_worker, ports, control) =
    TxWorker::start(&tx_id, &cmd_tx, &[], want_control, tx_sink(ctx.agg.clone(), tx_id.clone()))?;

  // The worker binds one ephemeral input per NIC and reports them back before we can wire.
  let tx_ports = match ports.wait().await {
    Ok(ports) => ports,
    Err(err) => {
      tx_worker.stop(STOP_GRACE).await;
      return Err(err.into());
    }
  };
  let control_port = match control {
    Some(promise) => match promise.wait().await {
      Ok(port) => port,
      Err(err) => {
        tx_worker.stop(STOP_GRACE).await;
        return Err(err.into());
      }
    },
    None => cfg.control_port,
  };
  info!("{name} uses wfb_tx ports {tx_ports:?}, control port {control_port}");

  let p_tx_l = match allocate_tx_proxies(&ctx.wlans, &tx_ports).await {
    Ok(proxies) => proxies,
    Err(err) => {
      tx_worker.stop(STOP_GRACE).await;
      return Err(err);
    }
  };

  register_ant_sel(&ctx.agg, p_in.peer(), &p_tx_l);
  register_rssi(&ctx.agg, p_in.rssi_sender());

  let rx_id = format!("{name} rx");
  let rx_worker = match RxWorker::start(&rx_id, &cmd_rx, &[], rx_sink(ctx.agg.clone(), rx_id.clone())) {
    Ok(worker) => worker,
    Err(err) => {
      tx_worker.stop(STOP_GRACE).await;
      return Err(err.into());
    }
  };

  let result = supervise(ctx.shutdown.clone(), Some(tx_worker), Some(rx_worker)).await;

  // Proxies (sockets, serial port, fan-out listener) close on drop.
  drop(p_tx_l);
  drop(p_rx);
  drop(p_in);
  drop(fanout);
  result
}

async fn run_tunnel(name: &str, cfg: &Stream, ctx: ServiceCtx) -> Result<(), ServiceError> {
  let stream_rx = require_stream(name, "stream_rx", cfg.stream_rx)?;
  let stream_tx = require_stream(name, "stream_tx", cfg.stream_tx)?;

  let p_in = TunTapProxy::open(TunOpts {
    ifname: cfg.ifname.clone(),
    ifaddr: cfg.ifaddr.clone(),
    mtu: ctx.common.radio_mtu,
    default_route: cfg.default_route,
    agg_timeout: Duration::from_secs_f64(ctx.common.tunnel_agg_timeout),
  })
  .await?;

  let p_rx = UdpProxy::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), None).await?;
  p_rx.peer().set(p_in.sender());

  let cmd_rx = rx_cmd(&ctx, cfg, stream_rx, Some(p_rx.local_port()), None);
  let cmd_tx = tx_cmd(&ctx, cfg, stream_tx, 0, &ctx.wlans);
  info!("{name} RX: {}", cmd_rx.join(" "));
  info!("{name} TX: {}", cmd_tx.join(" "));

  let tx_id = format!("{name} tx");
  let want_control = cfg.control_port == 0;
  let (mut tx_worker, ports, control) =
    TxWorker::start(&tx_id, &cmd_tx, &[], want_control, tx_sink(ctx.agg.clone(), tx_id.clone()))?;

  let tx_ports = match ports.wait().await {
    Ok(ports) => ports,
    Err(err) => {
      tx_worker.stop(STOP_GRACE).await;
      return Err(err.into());
    }
  };
  let control_port = match control {
    Some(promise) => match promise.wait().await {
      Ok(port) => port,
      Err(err) => {
        tx_worker.stop(STOP_GRACE).await;
        return Err(err.into());
      }
    },
    None => cfg.control_port,
  };
  info!("{name} uses wfb_tx ports {tx_ports:?}, control port {control_port}");

  let p_tx_l = match allocate_tx_proxies(&ctx.wlans, &tx_ports).await {
    Ok(proxies) => proxies,
    Err(err) => {
      tx_worker.stop(STOP_GRACE).await;
      return Err(err);
    }
  };

  // Keep-alives go to every card so direct antennas work on both ends; with mirroring the
  // worker already duplicates frames, so one forwarder suffices.
  let all: Vec<PacketSender> = if cfg.mirror {
    p_tx_l.iter().take(1).map(|p| p.sender()).collect()
  } else {
    p_tx_l.iter().map(|p| p.sender()).collect()
  };
  p_in.all_peers().set(all);

  register_ant_sel(&ctx.agg, p_in.peer(), &p_tx_l);

  let rx_id = format!("{name} rx");
  let rx_worker = match RxWorker::start(&rx_id, &cmd_rx, &[], rx_sink(ctx.agg.clone(), rx_id.clone())) {
    Ok(worker) => worker,
    Err(err) => {
      tx_worker.stop(STOP_GRACE).await;
      return Err(err.into());
    }
  };

  let result = supervise(ctx.shutdown.clone(), Some(tx_worker), Some(rx_worker)).await;
  drop(p_tx_l);
  drop(p_rx);
  drop(p_in);
  result
}

async fn run_udp_proxy(name: &str, cfg: &Stream, ctx: ServiceCtx) -> Result<(), ServiceError> {
  let (bind, connect) = match parse_peer(name, &cfg.peer)? {
    PeerUri::Connect(addr) => {
      info!("connect {name} stream {:?}(RX), {:?}(TX) to {addr}", cfg.stream_rx, cfg.stream_tx);
      (SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)), Some(SocketAddr::V4(addr)))
    }
    PeerUri::Listen(addr) => {
      info!("listen for {name} stream {:?}(RX), {:?}(TX) on {addr}", cfg.stream_rx, cfg.stream_tx);
      (SocketAddr::V4(addr), None)
    }
    PeerUri::Serial { .. } => {
      return Err(ServiceError::Config(format!("{name}: unsupported peer address: {}", cfg.peer)));
    }
  };

  let p_in = UdpProxy::bind(bind, connect).await?;

  let mut p_rx = None;
  let mut rx_worker = None;
  if let Some(stream_rx) = cfg.stream_rx {
    let rx_proxy = UdpProxy::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), None).await?;
    rx_proxy.peer().set(p_in.sender());

    let cmd_rx = rx_cmd(&ctx, cfg, stream_rx, Some(rx_proxy.local_port()), None);
    info!("{name} RX: {}", cmd_rx.join(" "));

    let rx_id = format!("{name} rx");
    rx_worker = Some(RxWorker::start(&rx_id, &cmd_rx, &[], rx_sink(ctx.agg.clone(), rx_id.clone()))?);
    p_rx = Some(rx_proxy);
  }

  let mut p_tx_l = Vec::new();
  let mut tx_worker = None;
  if let Some(stream_tx) = cfg.stream_tx {
    let cmd_tx = tx_cmd(&ctx, cfg, stream_tx, 0, &ctx.wlans);
    info!("{name} TX: {}", cmd_tx.join(" "));

    let tx_id = format!("{name} tx");
    let want_control = cfg.control_port == 0;
    let (mut worker, ports, control) = match TxWorker::start(
      &tx_id,
      &cmd_tx,
      &[],
      want_control,
      tx_sink(ctx.agg.clone(), tx_id.clone()),
    ) {
      Ok(started) => started,
      Err(err) => {
        if let Some(mut rx) = rx_worker {
          rx.stop(STOP_GRACE).await;
        }
        return Err(err.into());
      }
    };

    let wired: Result<Vec<UdpProxy>, ServiceError> = async {
      let tx_ports = ports.wait().await?;
      let control_port = match control {
        Some(promise) => promise.wait().await?,
        None => cfg.control_port,
      };
      info!("{name} uses wfb_tx ports {tx_ports:?}, control port {control_port}");
      allocate_tx_proxies(&ctx.wlans, &tx_ports).await
    }
    .await;

    match wired {
      Ok(proxies) => p_tx_l = proxies,
      Err(err) => {
        worker.stop(STOP_GRACE).await;
        if let Some(mut rx) = rx_worker {
          rx.stop(STOP_GRACE).await;
        }
        return Err(err);
      }
    }

    register_ant_sel(&ctx.agg, p_in.peer(), &p_tx_l);
    tx_worker = Some(worker);
  }

  let result = supervise(ctx.shutdown.clone(), tx_worker, rx_worker).await;
  drop(p_tx_l);
  drop(p_rx);
  drop(p_in);
  result
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Settings;
  use stats::agg::{AggregatorConfig, SelectorTuning};
  use std::os::unix::fs::PermissionsExt;

  fn stream(snippet: &str) -> Stream {
    toml::from_str(snippet).unwrap()
  }

  fn ctx_with(wlans: &[&str], paths: Paths) -> (ServiceCtx, watch::Sender<bool>) {
    let wlans: Vec<String> = wlans.iter().map(|w| w.to_string()).collect();
    let agg = Aggregator::new(
      AggregatorConfig {
        profile: "gs".to_string(),
        wlans: wlans.clone(),
        link_domain: "default".to_string(),
        version: "0.4.0".to_string(),
        tuning: SelectorTuning::default(),
        mavlink_err_rate: false,
        debug: false,
      },
      None,
    );
    let (shutdown_tx, shutdown) = watch::channel(false);
    let ctx = ServiceCtx {
      link_id: base::link_id_for_domain("default"),
      wlans,
      agg,
      common: Arc::new(Common::default()),
      paths: Arc::new(paths),
      binlog: None,
      shutdown,
    };
    (ctx, shutdown_tx)
  }

  fn ctx(wlans: &[&str]) -> (ServiceCtx, watch::Sender<bool>) {
    ctx_with(wlans, Paths::default())
  }

  #[tokio::test]
  async fn udp_direct_tx_rejects_connect_scheme() {
    let (ctx, _guard) = ctx(&["wlan0"]);
    let cfg = stream(
      r#"
        name = "video"
        service_type = "udp_direct_tx"
        peer = "connect://127.0.0.1:5600"
        keypair = "gs.key"
        stream_tx = 0
      "#,
    );
    match run_service("video", &cfg, ctx).await {
      Err(ServiceError::Config(msg)) => assert!(msg.contains("unsupported peer address")),
      other => panic!("unexpected result: {other:?}"),
    }
  }

  #[tokio::test]
  async fn udp_direct_rx_rejects_listen_scheme() {
    let (ctx, _guard) = ctx(&["wlan0"]);
    let cfg = stream(
      r#"
        name = "video"
        service_type = "udp_direct_rx"
        peer = "listen://0.0.0.0:5600"
        keypair = "gs.key"
        stream_rx = 0
      "#,
    );
    assert!(matches!(run_service("video", &cfg, ctx).await, Err(ServiceError::Config(_))));
  }

  #[tokio::test]
  async fn udp_proxy_rejects_serial_scheme() {
    let (ctx, _guard) = ctx(&["wlan0"]);
    let cfg = stream(
      r#"
        name = "proxy"
        service_type = "udp_proxy"
        peer = "serial:ttyUSB0:115200"
        keypair = "gs.key"
      "#,
    );
    assert!(matches!(run_service("proxy", &cfg, ctx).await, Err(ServiceError::Config(_))));
  }

  #[tokio::test]
  async fn udp_direct_tx_rejects_diversity_without_mirror() {
    let (ctx, _guard) = ctx(&["wlan0", "wlan1"]);
    let cfg = stream(
      r#"
        name = "video"
        service_type = "udp_direct_tx"
        peer = "listen://0.0.0.0:5600"
        keypair = "gs.key"
        stream_tx = 0
      "#,
    );
    match run_service("video", &cfg, ctx).await {
      Err(ServiceError::Config(msg)) => assert!(msg.contains("diversity")),
      other => panic!("unexpected result: {other:?}"),
    }
  }

  #[test]
  fn rx_cmd_matches_worker_schema() {
    let (ctx, _guard) = ctx(&["wlan0", "wlan1"]);
    let cfg = stream(
      r#"
        name = "video"
        service_type = "udp_direct_rx"
        peer = "connect://10.0.0.1:5600"
        keypair = "gs.key"
        stream_rx = 0
      "#,
    );
    let cmd = rx_cmd(&ctx, &cfg, 0, None, Some("10.0.0.1:5600".parse().unwrap()));
    let link_id = base::link_id_for_domain("default");
    assert_eq!(
      cmd.join(" "),
      format!("/usr/bin/wfb_rx -p 0 -c 10.0.0.1 -u 5600 -K /etc/gs.key -i {link_id} wlan0 wlan1")
    );
  }

  #[test]
  fn tx_cmd_matches_worker_schema() {
    let (ctx, _guard) = ctx(&["wlan0"]);
    let cfg = stream(
      r#"
        name = "mavlink"
        service_type = "mavlink"
        peer = "connect://127.0.0.1:14550"
        keypair = "drone.key"
        stream_rx = 16
        stream_tx = 144
        use_qdisc = true
        fwmark = 20
        mirror = true
      "#,
    );
    let cmd = tx_cmd(&ctx, &cfg, 144, 0, &ctx.wlans);
    let cmd = cmd.join(" ");
    assert!(cmd.starts_with("/usr/bin/wfb_tx -f data -p 144 -u 0 -K /etc/drone.key -B 20 -G long"));
    assert!(cmd.contains(" -m "));
    assert!(cmd.contains(" -Q -P 20 "));
    assert!(cmd.contains(" -k 8 -n 12 "));
    assert!(cmd.contains(" -C 0 "));
    assert!(cmd.ends_with(" wlan0"));
  }

  fn fake_worker(dir: &std::path::Path, bin: &str, script: &str) {
    let path = dir.join(bin);
    std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
  }

  #[tokio::test]
  async fn worker_exit_fails_the_service() {
    let dir = tempfile::tempdir().unwrap();
    fake_worker(dir.path(), "wfb_tx", "exit 1");
    let paths = Paths { bin_dir: dir.path().to_path_buf(), ..Paths::default() };
    let (ctx, _guard) = ctx_with(&["wlan0"], paths);

    let cfg = stream(
      r#"
        name = "video"
        service_type = "udp_direct_tx"
        peer = "listen://0.0.0.0:5600"
        keypair = "gs.key"
        stream_tx = 0
      "#,
    );
    // The worker dies before announcing a control port: the pending promise is
    // cancelled and the service fails.
    match run_service("video", &cfg, ctx).await {
      Err(ServiceError::Worker(err)) => {
        assert!(matches!(err, supervisor::WorkerError::WorkerExited { .. }));
      }
      other => panic!("unexpected result: {other:?}"),
    }
  }

  #[tokio::test]
  async fn mavlink_service_wires_and_shuts_down_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    fake_worker(
      dir.path(),
      "wfb_tx",
      "printf '1\\tLISTEN_UDP\\t5801:wlan0\\n1\\tLISTEN_UDP_END\\n'; sleep 5",
    );
    fake_worker(
      dir.path(),
      "wfb_rx",
      "printf '1\\tSESSION\\t1:1:8:12\\n1\\tPKT\\t0:0:0:0:0:0:0:0:0\\n'; sleep 5",
    );
    let paths = Paths { bin_dir: dir.path().to_path_buf(), ..Paths::default() };
    let (ctx, shutdown_tx) = ctx_with(&["wlan0"], paths);
    let agg = ctx.agg.clone();

    let cfg = stream(
      r#"
        name = "mavlink"
        service_type = "mavlink"
        peer = "connect://127.0.0.1:14550"
        keypair = "gs.key"
        stream_rx = 16
        stream_tx = 144
        control_port = 9000
        inject_rssi = true
      "#,
    );

    let service = tokio::spawn(async move { run_service("mavlink", &cfg, ctx).await });

    // Give the builder time to discover ports and wire the proxies.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(agg.tx_sel(), 0);
    assert!(!service.is_finished());

    shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), service).await.unwrap().unwrap();
    assert!(result.is_ok(), "service did not shut down cleanly: {result:?}");
  }

  #[test]
  fn sample_config_supports_all_service_types() {
    let text = r#"
      [profiles.gs]
      link_domain = "default"

      [[profiles.gs.streams]]
      name = "tunnel"
      service_type = "tunnel"
      keypair = "gs.key"
      stream_rx = 32
      stream_tx = 160
      ifname = "gs-tun"
      ifaddr = "10.5.0.1/24"
    "#;
    let settings: Settings = toml::from_str(text).unwrap();
    let tunnel = &settings.profiles["gs"].streams[0];
    assert_eq!(tunnel.service_type, ServiceType::Tunnel);
    assert_eq!(tunnel.ifname, "gs-tun");
  }
}
