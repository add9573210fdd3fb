//! 启动时从目录加载规则集和资产
//!
//! 规则目录布局：
//!
//! ```text
//! rules/
//! ├── global/*.json
//! ├── tenant/<tenant-id>/*.json
//! └── asset/<asset-id>/*.json
//! ```
//!
//! 文件名（去掉扩展名）作为规则集 ID，文件修改时间（秒）作为版本号。

use crate::manager::DeploymentManager;
use crate::models::{RuleUnit, Scope, UnitStatus};
use rule_engine::RuleEngine;
use rules_shared::assets::EntityRecord;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("读取 {path} 失败: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("解析 {path} 失败: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// 目录中的一个规则集文件
#[derive(Debug)]
pub struct RulesetFile {
    pub scope: Scope,
    pub unit: RuleUnit,
    pub path: PathBuf,
}

/// 扫描规则目录，按作用域、文件名排序返回
pub fn scan_rules_dir(root: &Path) -> Result<Vec<RulesetFile>, LoadError> {
    let mut files = Vec::new();

    let global = root.join("global");
    if global.is_dir() {
        collect_units(&global, Scope::Global, &mut files)?;
    }

    for (kind, make_scope) in [
        ("tenant", Scope::Tenant as fn(String) -> Scope),
        ("asset", Scope::Asset as fn(String) -> Scope),
    ] {
        let dir = root.join(kind);
        if !dir.is_dir() {
            continue;
        }
        for (name, path) in sorted_entries(&dir)? {
            if path.is_dir() {
                collect_units(&path, make_scope(name), &mut files)?;
            }
        }
    }

    Ok(files)
}

fn collect_units(dir: &Path, scope: Scope, files: &mut Vec<RulesetFile>) -> Result<(), LoadError> {
    for (_, path) in sorted_entries(dir)? {
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };

        let source = fs::read_to_string(&path).map_err(|source| LoadError::Io {
            path: path.clone(),
            source,
        })?;
        let version = modified_secs(&path)?;

        files.push(RulesetFile {
            scope: scope.clone(),
            unit: RuleUnit::new(id, version, source),
            path,
        });
    }
    Ok(())
}

fn sorted_entries(dir: &Path) -> Result<Vec<(String, PathBuf)>, LoadError> {
    let io_err = |source| LoadError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        entries.push((name, entry.path()));
    }
    entries.sort();
    Ok(entries)
}

fn modified_secs(path: &Path) -> Result<u64, LoadError> {
    let modified = fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default())
}

/// 加载规则目录到管理器，返回成功部署的规则集数量
///
/// 单个规则集编译失败只记录告警，作用域状态可通过诊断快照查看。
pub fn load_rules_dir<E: RuleEngine>(
    manager: &DeploymentManager<E>,
    root: &Path,
) -> Result<usize, LoadError> {
    let files = scan_rules_dir(root)?;
    let total = files.len();
    let mut deployed = 0;

    for file in files {
        let unit_id = file.unit.id.clone();
        match manager.insert_ruleset(file.scope.clone(), file.unit) {
            Ok(UnitStatus::Deployed) => deployed += 1,
            Ok(status) => warn!(
                scope = %file.scope,
                unit_id = %unit_id,
                %status,
                path = %file.path.display(),
                "规则集未能部署"
            ),
            Err(e) => warn!(scope = %file.scope, unit_id = %unit_id, error = %e, "加载规则集失败"),
        }
    }

    info!(total, deployed, dir = %root.display(), "规则目录加载完成");
    Ok(deployed)
}

/// 读取资产种子文件（实体记录的 JSON 数组）
pub fn load_assets_file(path: &Path) -> Result<Vec<EntityRecord>, LoadError> {
    let content = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| LoadError::Json {
        path: path.to_path_buf(),
        source,
    })
}
