//! Output file name templating
//!
//! Backup file names are rendered with minijinja using strict undefined
//! behavior, so a typo in a template fails the backup instead of silently
//! producing an empty segment. Available variables:
//!
//! - `database`: Database record name
//! - `database_name`: name of the database on the server
//! - `namespace`: namespace of the backup
//! - `backup`: DatabaseBackup name
//! - `engine`: `postgres` or `mysql`
//! - `run_id`: run identifier, also used in the Job name
//! - `timestamp`: dispatch time, `YYYYMMDDTHHMMSSZ`
//! - `date`: dispatch date, `YYYY-MM-DD`

use chrono::{DateTime, Utc};
use minijinja::{context, Environment, UndefinedBehavior};

use crate::Error;

/// Inputs available to a file name template
#[derive(Clone, Debug)]
pub struct FilenameContext<'a> {
    /// Database record name
    pub database: &'a str,
    /// Database name on the server
    pub database_name: &'a str,
    /// Backup namespace
    pub namespace: &'a str,
    /// Backup name
    pub backup: &'a str,
    /// Engine name
    pub engine: &'a str,
    /// Run identifier
    pub run_id: &'a str,
    /// Dispatch time
    pub time: DateTime<Utc>,
}

/// Renders output file names
pub struct FilenameRenderer {
    env: Environment<'static>,
}

impl Default for FilenameRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl FilenameRenderer {
    /// Create a renderer with strict undefined handling
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self { env }
    }

    /// Render `template` into a single path segment
    pub fn render(&self, template: &str, ctx: &FilenameContext<'_>) -> Result<String, Error> {
        let rendered = self
            .env
            .render_str(
                template,
                context! {
                    database => ctx.database,
                    database_name => ctx.database_name,
                    namespace => ctx.namespace,
                    backup => ctx.backup,
                    engine => ctx.engine,
                    run_id => ctx.run_id,
                    timestamp => ctx.time.format("%Y%m%dT%H%M%SZ").to_string(),
                    date => ctx.time.format("%Y-%m-%d").to_string(),
                },
            )
            .map_err(|e| Error::template(template, e.to_string()))?;

        let rendered = rendered.trim();
        if rendered.is_empty() {
            return Err(Error::template(template, "rendered to an empty file name"));
        }
        if rendered.contains('/') {
            return Err(Error::template(template, "file name must not contain '/'"));
        }
        Ok(rendered.to_string())
    }

    /// Check a template against placeholder values without dispatching anything
    pub fn validate(&self, template: &str) -> Result<(), Error> {
        self.render(
            template,
            &FilenameContext {
                database: "db",
                database_name: "db",
                namespace: "ns",
                backup: "backup",
                engine: "postgres",
                run_id: "00000000",
                time: DateTime::<Utc>::default(),
            },
        )
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DEFAULT_FILENAME_TEMPLATE;
    use chrono::TimeZone;

    fn ctx() -> FilenameContext<'static> {
        FilenameContext {
            database: "orders",
            database_name: "orders_prod",
            namespace: "shop",
            backup: "nightly-20260120-0200",
            engine: "postgres",
            run_id: "a1b2c3d4",
            time: Utc.with_ymd_and_hms(2026, 1, 20, 2, 0, 7).unwrap(),
        }
    }

    #[test]
    fn test_default_template() {
        let name = FilenameRenderer::new()
            .render(DEFAULT_FILENAME_TEMPLATE, &ctx())
            .expect("render");
        assert_eq!(name, "orders-20260120T020007Z-a1b2c3d4.dump");
    }

    #[test]
    fn test_custom_template_variables() {
        let name = FilenameRenderer::new()
            .render("{{ engine }}/{{ database_name }}.sql", &ctx())
            .unwrap_err();
        assert!(name.to_string().contains("must not contain '/'"));

        let name = FilenameRenderer::new()
            .render("{{ namespace }}_{{ database_name }}_{{ date }}.sql.gz", &ctx())
            .expect("render");
        assert_eq!(name, "shop_orders_prod_2026-01-20.sql.gz");
    }

    #[test]
    fn test_undefined_variable_is_an_error() {
        let renderer = FilenameRenderer::new();
        let err = renderer.validate("{{ datbase }}.dump").unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("{{ datbase }}.dump"));

        assert!(renderer.validate(DEFAULT_FILENAME_TEMPLATE).is_ok());
    }

    #[test]
    fn test_empty_render_is_an_error() {
        assert!(FilenameRenderer::new().validate("{{ '' }}").is_err());
    }
}
