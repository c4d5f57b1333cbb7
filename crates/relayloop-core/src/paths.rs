use std::path::PathBuf;

/// Returns the relayloop home directory (~/.relayloop)
pub fn relayloop_home() -> PathBuf {
    dirs::home_dir()
        .expect("Could not determine home directory")
        .join(".relayloop")
}

/// Returns the path to the layered config file (relayloop.toml)
pub fn config_path() -> PathBuf {
    relayloop_home().join("relayloop.toml")
}

/// Returns the sessions directory for a given agent name
pub fn agent_sessions_dir(agent_name: &str) -> PathBuf {
    relayloop_home().join("agents").join(agent_name)
}

/// Returns the path to the SQLite session database for a given agent name
pub fn session_db_path(agent_name: &str) -> PathBuf {
    agent_sessions_dir(agent_name).join("sessions.db")
}
