use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};

use crate::scheduler::Scheduler;

/// Read-only diagnostics over the live scheduler state. Takes read guards
/// only; it never competes with handlers for the write side.
#[derive(Clone)]
pub struct DashboardState {
    pub scheduler: Arc<RwLock<Scheduler>>,
}

#[derive(Serialize)]
struct StatusResponse {
    tasks: usize,
    task_states: HashMap<String, usize>,
    workers: usize,
    idle_workers: usize,
    clients: usize,
    ready_queue: usize,
    unrunnable: usize,
}

#[derive(Serialize)]
struct WorkerResponse {
    address: String,
    hostname: String,
    ncores: u32,
    processing: usize,
    held_keys: usize,
    stacked: usize,
    idle: bool,
    last_heartbeat_ms: u128,
    metrics: HashMap<String, f64>,
}

#[derive(Serialize)]
struct TaskResponse {
    key: String,
    state: String,
    nbytes: Option<u64>,
    suspicion: u32,
    dependencies: usize,
    dependents: usize,
    replicas: Vec<String>,
    wanted_by: Vec<String>,
    created_at: String,
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    let app = Router::new()
        .route("/", get(index))
        .route("/api/status", get(status))
        .route("/api/workers", get(workers))
        .route("/api/tasks", get(tasks))
        .route("/api/tasks/:key", get(task_detail))
        .layer(cors)
        .with_state(state);

    tracing::info!(addr = %addr, "Dashboard listening");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, "Failed to bind dashboard address");
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn index() -> Html<&'static str> {
    Html(
        "<html><head><title>taskmesh</title></head><body>\
         <h1>taskmesh scheduler</h1>\
         <ul>\
         <li><a href=\"/api/status\">/api/status</a></li>\
         <li><a href=\"/api/workers\">/api/workers</a></li>\
         <li><a href=\"/api/tasks\">/api/tasks</a></li>\
         </ul></body></html>",
    )
}

async fn status(State(state): State<DashboardState>) -> impl IntoResponse {
    let sched = state.scheduler.read().await;
    let mut task_states: HashMap<String, usize> = HashMap::new();
    for task in sched.state.tasks.values() {
        *task_states.entry(task.state.to_string()).or_insert(0) += 1;
    }
    Json(StatusResponse {
        tasks: sched.state.tasks.len(),
        task_states,
        workers: sched.state.workers.len(),
        idle_workers: sched.state.idle.len(),
        clients: sched.state.clients.len(),
        ready_queue: sched.state.ready.len(),
        unrunnable: sched.state.unrunnable.len(),
    })
}

async fn workers(State(state): State<DashboardState>) -> impl IntoResponse {
    let sched = state.scheduler.read().await;
    let mut out: Vec<WorkerResponse> = sched
        .state
        .workers
        .values()
        .map(|w| WorkerResponse {
            address: w.address.clone(),
            hostname: w.hostname.clone(),
            ncores: w.ncores,
            processing: sched
                .state
                .processing
                .get(&w.address)
                .map(|p| p.len())
                .unwrap_or(0),
            held_keys: sched
                .state
                .has_what
                .get(&w.address)
                .map(|h| h.len())
                .unwrap_or(0),
            stacked: sched
                .state
                .stacks
                .get(&w.address)
                .map(|s| s.len())
                .unwrap_or(0),
            idle: sched.state.idle.contains(&w.address),
            last_heartbeat_ms: w.last_heartbeat.elapsed().as_millis(),
            metrics: w.metrics.clone(),
        })
        .collect();
    out.sort_by(|a, b| a.address.cmp(&b.address));
    Json(out)
}

async fn tasks(State(state): State<DashboardState>) -> impl IntoResponse {
    let sched = state.scheduler.read().await;
    let mut out: Vec<TaskResponse> = sched
        .state
        .tasks
        .keys()
        .map(|key| task_response(&sched, key))
        .collect();
    out.sort_by(|a, b| a.key.cmp(&b.key));
    Json(out)
}

async fn task_detail(
    State(state): State<DashboardState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    let sched = state.scheduler.read().await;
    if !sched.state.tasks.contains_key(&key) {
        return (StatusCode::NOT_FOUND, format!("no such task: {key}")).into_response();
    }
    Json(task_response(&sched, &key)).into_response()
}

fn task_response(sched: &Scheduler, key: &str) -> TaskResponse {
    let task = &sched.state.tasks[key];
    let mut replicas: Vec<String> = sched.state.replicas(key).cloned().collect();
    replicas.sort_unstable();
    let mut wanted_by: Vec<String> = sched.state.desired_by(key).cloned().collect();
    wanted_by.sort_unstable();
    TaskResponse {
        key: key.to_string(),
        state: task.state.to_string(),
        nbytes: task.nbytes,
        suspicion: task.suspicion,
        dependencies: sched.state.dependencies[key].len(),
        dependents: sched.state.dependents[key].len(),
        replicas,
        wanted_by,
        created_at: task.created_at.to_rfc3339(),
    }
}
