// Centralized environment variable access for the gateway binary.
// Only bootstrap knobs live here; everything else is read from the
// settings table at runtime. Other modules should never read these
// env vars directly; use the typed getters below instead.

const DEFAULT_DATABASE_PATH: &str = "mcp-gateway.db";

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(name: &str) -> bool {
    matches!(
        env_opt(name).as_deref().map(str::to_ascii_lowercase).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

/// Path of the sqlite store ($DATABASE_URL, default `mcp-gateway.db`)
pub fn database_url() -> String {
    env_opt("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string())
}

/// Whether first-run setup is requested ($INITIAL_SETUP=1|true|yes|on)
pub fn initial_setup() -> bool {
    env_bool("INITIAL_SETUP")
}

/// Deployment environment name ($ENV, default `development`)
pub fn env_name() -> String {
    env_opt("ENV").unwrap_or_else(|| "development".to_string())
}

pub fn is_production() -> bool {
    env_name() == "production"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_url_falls_back_to_default() {
        std::env::remove_var("DATABASE_URL");
        assert_eq!(database_url(), "mcp-gateway.db");
    }

    #[test]
    fn env_bool_parses_truthy_values() {
        std::env::set_var("MCP_GATEWAY_TEST_FLAG", "yes");
        assert!(env_bool("MCP_GATEWAY_TEST_FLAG"));
        std::env::set_var("MCP_GATEWAY_TEST_FLAG", "0");
        assert!(!env_bool("MCP_GATEWAY_TEST_FLAG"));
        std::env::remove_var("MCP_GATEWAY_TEST_FLAG");
    }
}
