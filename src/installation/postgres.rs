// PostgreSQL install and configuration
//
// The engine version is not known until the package is installed, so the config
// directory is discovered from the installed server binary and substituted into the
// bundled template before each line is executed.

use std::path::{Component, Path};

use log::{debug, info};

use crate::config::ProvisioningConfig;
use crate::error::InstallError;
use crate::installation::{CommandRunner, OutputSink};

pub const BUNDLED_TEMPLATE: &str = include_str!("../../resources/configure_postgresql.conf");

/// Placeholder replaced with the versioned configuration directory.
pub const CONF_PATH_PLACEHOLDER: &str = "$PSQL_CONF_PATH";

pub const LOCATE_SERVER_BINARY: &str = "find /usr -wholename '*/bin/postgres'";

/// Version directory from `find` output, e.g. `/usr/lib/postgresql/13/bin/postgres` -> `13`.
///
/// Uses the first non-empty line; the version is the fourth path component.
pub fn parse_engine_version(find_output: &str) -> Result<String, InstallError> {
    let line = find_output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| InstallError::EngineVersionNotFound(find_output.trim().to_string()))?;

    Path::new(line)
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .nth(3)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| InstallError::EngineVersionNotFound(line.to_string()))
}

pub fn config_dir(version: &str) -> String {
    format!("/etc/postgresql/{}/main", version)
}

/// Command lines of the template with the config directory substituted.
/// Blank lines and `#` comments are skipped.
pub fn render_template(template: &str, version: &str) -> Vec<String> {
    let dir = config_dir(version);
    template
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.replace(CONF_PATH_PLACEHOLDER, &dir))
        .collect()
}

/// Quote a SQL literal for use inside a double-quoted `sh -c` argument.
fn sql_literal(value: &str) -> String {
    let sql = value.replace('\'', "''");
    let mut out = String::with_capacity(sql.len() + 2);
    out.push('\'');
    for c in sql.chars() {
        if matches!(c, '"' | '$' | '`' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

fn psql_as_postgres(sql: &str) -> String {
    format!("sudo -u postgres psql -c \"{}\"", sql)
}

pub fn admin_password_command(password: &str) -> String {
    psql_as_postgres(&format!(
        "ALTER user postgres WITH PASSWORD {}",
        sql_literal(password)
    ))
}

pub fn replication_role_command(password: &str) -> String {
    psql_as_postgres(&format!(
        "CREATE ROLE replication WITH REPLICATION PASSWORD {} LOGIN",
        sql_literal(password)
    ))
}

/// Install the server package, apply the template, check the service and set roles.
///
/// Returns the discovered engine version.
pub async fn install_and_configure(
    runner: &dyn CommandRunner,
    cfg: &ProvisioningConfig,
    template: &str,
    on_output: OutputSink<'_>,
) -> Result<String, InstallError> {
    let default_timeout = Some(cfg.default_command_timeout());

    runner
        .install_package(
            &cfg.database_package,
            std::time::Duration::from_secs(cfg.database_install_timeout_secs),
            on_output,
        )
        .await?;

    let found = runner
        .execute(LOCATE_SERVER_BINARY, default_timeout, None)
        .await?;
    let version = parse_engine_version(&found)?;
    info!(
        "[PHASE: provisioning] [STEP: database] Detected engine version (version={}, conf_dir={})",
        version,
        config_dir(&version)
    );

    for line in render_template(template, &version) {
        debug!("[PHASE: provisioning] [STEP: database] Applying template line");
        runner.execute(&line, default_timeout, on_output).await?;
    }

    if !runner.is_service_running(&cfg.database_service).await {
        return Err(InstallError::ServiceNotRunning(cfg.database_service.clone()));
    }

    runner
        .execute(
            &admin_password_command(&cfg.admin_password),
            default_timeout,
            on_output,
        )
        .await?;
    runner
        .execute(
            &replication_role_command(&cfg.replication_password),
            default_timeout,
            on_output,
        )
        .await?;

    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;

    const FIND_OUT: &str = "/usr/lib/postgresql/13/bin/postgres\n";

    #[test]
    fn version_is_fourth_path_component() {
        assert_eq!(parse_engine_version(FIND_OUT).expect("version"), "13");
        assert_eq!(
            parse_engine_version("\n/usr/lib/postgresql/15/bin/postgres\n/usr/lib/postgresql/13/bin/postgres\n")
                .expect("version"),
            "15"
        );
    }

    #[test]
    fn missing_or_short_path_is_version_not_found() {
        assert!(matches!(
            parse_engine_version(""),
            Err(InstallError::EngineVersionNotFound(_))
        ));
        assert!(matches!(
            parse_engine_version("/usr/bin/postgres"),
            Err(InstallError::EngineVersionNotFound(ref s)) if s == "/usr/bin/postgres"
        ));
    }

    #[test]
    fn template_substitutes_conf_dir_and_skips_comments() {
        let template = "# header\n\nsed -i x $PSQL_CONF_PATH/postgresql.conf\n  echo a >> $PSQL_CONF_PATH/pg_hba.conf  \n";
        assert_eq!(
            render_template(template, "13"),
            vec![
                "sed -i x /etc/postgresql/13/main/postgresql.conf",
                "echo a >> /etc/postgresql/13/main/pg_hba.conf",
            ]
        );
    }

    #[test]
    fn bundled_template_has_no_unresolved_placeholders() {
        let lines = render_template(BUNDLED_TEMPLATE, "13");
        assert!(!lines.is_empty());
        assert!(lines.iter().all(|l| !l.contains(CONF_PATH_PLACEHOLDER)));
    }

    #[test]
    fn role_commands_match_stock_layout() {
        assert_eq!(
            admin_password_command("password"),
            "sudo -u postgres psql -c \"ALTER user postgres WITH PASSWORD 'password'\""
        );
        assert_eq!(
            replication_role_command("password"),
            "sudo -u postgres psql -c \"CREATE ROLE replication WITH REPLICATION PASSWORD 'password' LOGIN\""
        );
    }

    #[test]
    fn passwords_are_quoted_for_sql_and_shell() {
        assert_eq!(
            admin_password_command("it's$\"x"),
            "sudo -u postgres psql -c \"ALTER user postgres WITH PASSWORD 'it''s\\$\\\"x'\""
        );
    }

    #[tokio::test]
    async fn runs_install_template_service_check_then_roles() {
        let runner = ScriptedRunner::new().with_output("find /usr", FIND_OUT);
        let cfg = ProvisioningConfig::default();
        let template = "cmd-a $PSQL_CONF_PATH\ncmd-b\n";

        let version = install_and_configure(&runner, &cfg, template, None)
            .await
            .expect("configure");

        assert_eq!(version, "13");
        assert_eq!(runner.installed_packages(), vec!["postgresql"]);
        assert_eq!(
            runner.executed(),
            vec![
                LOCATE_SERVER_BINARY.to_string(),
                "cmd-a /etc/postgresql/13/main".to_string(),
                "cmd-b".to_string(),
                admin_password_command("password"),
                replication_role_command("password"),
            ]
        );
    }

    #[tokio::test]
    async fn stopped_service_is_terminal_before_role_changes() {
        let runner = ScriptedRunner::new()
            .with_output("find /usr", FIND_OUT)
            .with_services_down();
        let err = install_and_configure(&runner, &ProvisioningConfig::default(), "", None)
            .await
            .expect_err("service down");

        assert!(matches!(err, InstallError::ServiceNotRunning(ref s) if s == "postgresql"));
        assert!(runner.executed().iter().all(|c| !c.contains("psql -c")));
    }
}
