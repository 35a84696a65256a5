use orchids_gateway::config::UpstreamEndpoints;
use tempfile::TempDir;

fn test_runtime(database_dsn: String) -> orchids_gateway::app::RuntimeConfig {
    orchids_gateway::app::RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        metrics_path: "/metrics".to_string(),
        database_dsn,
        admin_path: "/api".to_string(),
        endpoints: UpstreamEndpoints::default(),
        static_credentials: None,
        admin: None,
    }
}

#[tokio::test]
async fn sqlite_file_created_for_runtime_dsn() {
    let temp_dir = TempDir::new().expect("temp dir");
    let db_path = temp_dir.path().join("data").join("orchids.db");
    assert!(!db_path.exists());

    let runtime = test_runtime(format!("sqlite://{}", db_path.display()));
    let _state = orchids_gateway::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");

    assert!(db_path.exists());
}

#[tokio::test]
async fn sqlite_memory_dsn_starts_without_files() {
    let runtime = test_runtime("sqlite::memory:".to_string());
    let state = orchids_gateway::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");
    assert!(state.static_client.is_none());
    assert!(state.runtime.admin.is_none());
}
