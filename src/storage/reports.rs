//! Reports and their parameters.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};

use super::Pool;
use crate::report::{Parameter, Report};

/// Insert a report with no parameters. Returns its id.
pub fn insert_report(pool: &Pool, title: &str, byline: &str) -> Result<i64> {
    let report = Report {
        id: 0,
        title: title.to_string(),
        byline: byline.to_string(),
        parameters: Vec::new(),
    };
    report.validate()?;

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO reports (title, byline) VALUES (?1, ?2)",
        params![title, byline],
    )
    .context("Failed to insert report")?;
    Ok(conn.last_insert_rowid())
}

/// Insert a parameter definition after validating it. `param.id` is ignored.
pub fn insert_parameter(pool: &Pool, param: &Parameter) -> Result<i64> {
    param.validate()?;

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO parameters (name, label, data_type, default_expr, required)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            param.name,
            param.label,
            param.data_type.to_string(),
            param.default_expr,
            param.required as i64,
        ],
    )
    .with_context(|| format!("Failed to insert parameter '{}'", param.name))?;
    Ok(conn.last_insert_rowid())
}

/// Attach a parameter to a report's form at the given position.
pub fn attach_parameter(pool: &Pool, report_id: i64, parameter_id: i64, order: i64) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT OR REPLACE INTO report_parameters (report_id, parameter_id, order_on_form)
         VALUES (?1, ?2, ?3)",
        params![report_id, parameter_id, order],
    )
    .context("Failed to attach parameter")?;
    Ok(())
}

/// Load a report with its parameters in form order.
pub fn get(pool: &Pool, id: i64) -> Result<Option<Report>> {
    let conn = pool.get()?;
    let head = conn
        .query_row(
            "SELECT id, title, byline FROM reports WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;

    let Some((id, title, byline)) = head else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT p.id, p.name, p.label, p.data_type, p.default_expr, p.required
         FROM parameters p
         JOIN report_parameters rp ON rp.parameter_id = p.id
         WHERE rp.report_id = ?1
         ORDER BY rp.order_on_form, p.id",
    )?;
    let rows = stmt.query_map(params![id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, i64>(5)? != 0,
        ))
    })?;

    let mut parameters = Vec::new();
    for r in rows {
        let (pid, name, label, data_type, default_expr, required) = r?;
        parameters.push(Parameter {
            id: pid,
            name,
            label,
            data_type: data_type.parse()?,
            default_expr,
            required,
        });
    }

    Ok(Some(Report {
        id,
        title,
        byline,
        parameters,
    }))
}

/// List `(id, title, parameter count)` for every report.
pub fn list(pool: &Pool) -> Result<Vec<(i64, String, i64)>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT r.id, r.title, COUNT(rp.parameter_id)
         FROM reports r LEFT JOIN report_parameters rp ON rp.report_id = r.id
         GROUP BY r.id ORDER BY r.id",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;

    let mut list = Vec::new();
    for r in rows {
        list.push(r?);
    }
    Ok(list)
}
