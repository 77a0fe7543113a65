// src/config/validate.rs

use std::time::Duration;

use crate::config::model::{
    BreakerSection, ConfigFile, QueueSection, RawConfigFile, SpawnerSection, WorkerSection,
};
use crate::dag::{Record, topological_sort};
use crate::errors::{Result, WorkdagError};
use crate::scheduler::Predicate;
use crate::scheduler::gateway::valid_label;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::WorkdagError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;

        let queue = QueueSection {
            address: raw.queue.address.trim().to_string(),
            task_ttl: config_duration("queue.task_ttl", &raw.queue.task_ttl)?,
        };
        let worker = WorkerSection {
            idle_exit: config_duration("worker.idle_exit", &raw.worker.idle_exit)?,
            task_timeout: config_duration("worker.task_timeout", &raw.worker.task_timeout)?,
            pools: raw.worker.pools,
            capabilities: raw.worker.capabilities,
        };
        let breaker = BreakerSection {
            fail_max: raw.breaker.fail_max,
            reset_timeout: config_duration("breaker.reset_timeout", &raw.breaker.reset_timeout)?,
        };
        let spawner = SpawnerSection {
            warm_pool_size: raw.spawner.warm_pool_size,
            max_workers: raw.spawner.max_workers,
            poll_interval: config_duration("spawner.poll_interval", &raw.spawner.poll_interval)?,
            orphan_idle_threshold: config_duration(
                "spawner.orphan_idle_threshold",
                &raw.spawner.orphan_idle_threshold,
            )?,
        };

        validate_durations(&worker, &spawner)?;

        Ok(ConfigFile::new_unchecked(
            queue,
            worker,
            breaker,
            spawner,
            raw.manifest,
            raw.task,
        ))
    }
}

/// Parse `<n>ms`, `<n>s`, `<n>m` or `<n>h`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => scaled(value, 60),
        "h" => scaled(value, 60 * 60),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}

fn scaled(value: u64, secs_per_unit: u64) -> std::result::Result<Duration, String> {
    value
        .checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration {value} is too large"))
}

fn config_duration(field: &str, value: &str) -> Result<Duration> {
    parse_duration(value)
        .map_err(|e| WorkdagError::ConfigError(format!("[{field}] = {value:?}: {e}")))
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_tasks(cfg)?;
    validate_queue(cfg)?;
    validate_worker(cfg)?;
    validate_breaker_and_spawner(cfg)?;
    validate_tasks(cfg)?;
    validate_task_dependencies(cfg)?;
    validate_dag(cfg)?;
    Ok(())
}

fn ensure_has_tasks(cfg: &RawConfigFile) -> Result<()> {
    if cfg.task.is_empty() {
        return Err(WorkdagError::ConfigError(
            "config must contain at least one [task.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_queue(cfg: &RawConfigFile) -> Result<()> {
    let address = cfg.queue.address.trim();
    if address != "memory://" && address != "memory" {
        return Err(WorkdagError::ConfigError(format!(
            "[queue].address '{}' is not supported; only \"memory://\" is available",
            address
        )));
    }
    Ok(())
}

fn validate_worker(cfg: &RawConfigFile) -> Result<()> {
    if cfg.worker.pools.is_empty() {
        return Err(WorkdagError::ConfigError(
            "[worker].pools must name at least one pool".to_string(),
        ));
    }
    for pool in &cfg.worker.pools {
        if pool.trim().is_empty() || pool.contains('|') {
            return Err(WorkdagError::ConfigError(format!(
                "[worker].pools contains invalid pool name '{}'",
                pool
            )));
        }
    }
    for cap in &cfg.worker.capabilities {
        if !valid_label(cap) {
            return Err(WorkdagError::ConfigError(format!(
                "[worker].capabilities contains invalid label '{}'",
                cap
            )));
        }
    }
    Ok(())
}

fn validate_breaker_and_spawner(cfg: &RawConfigFile) -> Result<()> {
    if cfg.breaker.fail_max == 0 {
        return Err(WorkdagError::ConfigError(
            "[breaker].fail_max must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.spawner.warm_pool_size == 0 {
        return Err(WorkdagError::ConfigError(
            "[spawner].warm_pool_size must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.spawner.max_workers < cfg.spawner.warm_pool_size {
        return Err(WorkdagError::ConfigError(format!(
            "[spawner].max_workers ({}) must be >= warm_pool_size ({})",
            cfg.spawner.max_workers, cfg.spawner.warm_pool_size
        )));
    }
    Ok(())
}

/// Checks that need the parsed durations.
fn validate_durations(worker: &WorkerSection, spawner: &SpawnerSection) -> Result<()> {
    for (field, value) in [
        ("worker.idle_exit", worker.idle_exit),
        ("worker.task_timeout", worker.task_timeout),
        ("spawner.poll_interval", spawner.poll_interval),
    ] {
        if value.is_zero() {
            return Err(WorkdagError::ConfigError(format!(
                "[{field}] must be greater than zero"
            )));
        }
    }
    if spawner.orphan_idle_threshold <= worker.task_timeout {
        return Err(WorkdagError::ConfigError(format!(
            "[spawner.orphan_idle_threshold] ({:?}) must exceed [worker.task_timeout] ({:?})",
            spawner.orphan_idle_threshold, worker.task_timeout
        )));
    }
    Ok(())
}

fn validate_tasks(cfg: &RawConfigFile) -> Result<()> {
    for (name, task) in cfg.task.iter() {
        if let Some(pred) = &task.edge_pred {
            Predicate::parse(pred).map_err(|e| {
                WorkdagError::ConfigError(format!("task '{}' has an invalid edge_pred: {}", name, e))
            })?;
        }
        for label in &task.requires {
            if !valid_label(label) {
                return Err(WorkdagError::ConfigError(format!(
                    "task '{}' has invalid capability label '{}'",
                    name, label
                )));
            }
            if !cfg.worker.capabilities.contains(label) {
                return Err(WorkdagError::ConfigError(format!(
                    "task '{}' requires '{}', which [worker].capabilities does not advertise",
                    name, label
                )));
            }
        }
    }
    Ok(())
}

fn validate_task_dependencies(cfg: &RawConfigFile) -> Result<()> {
    for (name, task) in cfg.task.iter() {
        for dep in task.after.iter() {
            if !cfg.task.contains_key(dep) {
                return Err(WorkdagError::ConfigError(format!(
                    "task '{}' has unknown dependency '{}' in `after`",
                    name, dep
                )));
            }
            if dep == name {
                return Err(WorkdagError::ConfigError(format!(
                    "task '{}' cannot depend on itself in `after`",
                    name
                )));
            }
        }
    }
    Ok(())
}

fn validate_dag(cfg: &RawConfigFile) -> Result<()> {
    let records = task_records(cfg);
    topological_sort(&records)?;
    Ok(())
}

/// One graph record per configured task, in name order.
fn task_records(cfg: &RawConfigFile) -> Vec<Record> {
    cfg.task
        .iter()
        .map(|(name, task)| Record {
            id: name.clone(),
            deps: task.after.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duration_units() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("5s"), Ok(Duration::from_secs(5)));
        assert_eq!(parse_duration(" 10m "), Ok(Duration::from_secs(600)));
        assert_eq!(parse_duration("24h"), Ok(Duration::from_secs(86_400)));
    }

    #[test]
    fn rejects_bad_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("ten s").is_err());
        assert!(parse_duration("3d").is_err());
    }

    #[test]
    fn overflowing_durations_are_errors() {
        assert!(parse_duration("99999999999999999h").is_err());
        assert!(parse_duration("999999999999999999m").is_err());
        assert_eq!(
            parse_duration("18446744073709551615s"),
            Ok(Duration::from_secs(u64::MAX))
        );
    }
}
