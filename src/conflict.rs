//! 覆盖与冲突解析
//!
//! 同一对象在各插件中的版本按加载顺序构成覆盖链：
//!
//! - 胜出版本：链上最后一个版本；最后一个版本标记删除时没有胜出版本
//! - 与主文件相同：和链上紧邻的前一个版本字段完全相同的覆盖
//! - 直接冲突：所有不是"与主文件相同"的覆盖
//! - 扩展冲突：与最终版本不一致的覆盖，加上最终内容的引入者（若它是覆盖）
//!
//! 删除标记与任何未删除的版本都不相同。

use crate::collection::Collection;
use crate::formid::{FormKey, FormRef, GlobalId};
use crate::plugin::PluginId;
use crate::record::{Record, RecordId};
use crate::schema::FieldPath;
use crate::utils::{EspError, Result};
use serde::Serialize;
use std::collections::HashMap;

/// 两个版本内容是否相同
pub fn same_content(a: &Record, b: &Record) -> bool {
    match (a.is_deleted(), b.is_deleted()) {
        (true, true) => true,
        (false, false) => match (a.fields(), b.fields()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        _ => false,
    }
}

/// 覆盖链的分类结果（下标指向覆盖链）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainClassification {
    pub winner: Option<usize>,
    /// 最终内容的引入者（有胜出版本时）
    pub source: Option<usize>,
    pub identical_to_master: Vec<usize>,
    pub direct: Vec<usize>,
    pub extended: Vec<usize>,
}

/// 对覆盖链分类
pub fn classify_chain(chain: &[&Record]) -> ChainClassification {
    let Some(last) = chain.len().checked_sub(1) else {
        return ChainClassification::default();
    };

    let identical: Vec<bool> = (0..chain.len())
        .map(|i| i > 0 && same_content(chain[i], chain[i - 1]))
        .collect();

    // 最终内容的引入者
    let mut source = last;
    while source > 0 && identical[source] {
        source -= 1;
    }

    let winner = (!chain[last].is_deleted()).then_some(last);
    let mut result = ChainClassification {
        winner,
        source: winner.map(|_| source),
        ..Default::default()
    };
    for i in 1..chain.len() {
        if identical[i] {
            result.identical_to_master.push(i);
            continue;
        }
        result.direct.push(i);
        if i == source || !same_content(chain[i], chain[last]) {
            result.extended.push(i);
        }
    }
    result
}

/// 一个对象的冲突报告
#[derive(Debug, Clone, Serialize)]
pub struct ConflictReport {
    pub form_id: GlobalId,
    /// 覆盖链（从旧到新）
    #[serde(skip)]
    pub history: Vec<RecordId>,
    #[serde(skip)]
    pub winner: Option<RecordId>,
    #[serde(skip)]
    pub identical_to_master: Vec<RecordId>,
    #[serde(skip)]
    pub direct: Vec<RecordId>,
    #[serde(skip)]
    pub extended: Vec<RecordId>,
    /// 覆盖链上的插件名
    pub plugins: Vec<String>,
    pub winning_plugin: Option<String>,
    pub conflicting_plugins: Vec<String>,
}

/// 一条记录中被改写的引用字段
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceUpdate {
    pub record: RecordId,
    pub fields: Vec<FieldPath>,
}

/// `update_references` 的作用范围
#[derive(Debug, Clone, Copy)]
pub enum ReferenceScope {
    Record(RecordId),
    Plugin(PluginId),
}

impl Collection {
    fn chain(&self, key: FormKey) -> Result<Vec<&Record>> {
        self.overrides(key).iter().map(|&rid| self.records.get(rid)).collect()
    }

    /// 覆盖链（按加载顺序，包括已删除的版本）
    pub fn history(&self, global: GlobalId) -> Result<Vec<RecordId>> {
        Ok(self.overrides(self.form_key(global)?).to_vec())
    }

    /// 胜出版本
    pub fn winner(&self, global: GlobalId) -> Result<Option<RecordId>> {
        self.winner_of(self.form_key(global)?)
    }

    pub(crate) fn winner_of(&self, key: FormKey) -> Result<Option<RecordId>> {
        let chain = self.chain(key)?;
        Ok(classify_chain(&chain).winner.map(|i| self.overrides(key)[i]))
    }

    /// 记录是否胜出
    ///
    /// `extended` 为真时，从最终内容的引入者到链尾、内容都与胜出版本相同的记录也算胜出。
    pub fn is_winning(&self, record: RecordId, extended: bool) -> Result<bool> {
        let Some(key) = self.records.get(record)?.key else {
            return Ok(false);
        };
        let history = self.overrides(key);
        let Some(position) = history.iter().position(|&rid| rid == record) else {
            return Ok(false);
        };
        let classes = classify_chain(&self.chain(key)?);
        Ok(match (classes.winner, classes.source) {
            (Some(winner), _) if !extended => position == winner,
            (Some(_), Some(source)) => position >= source,
            _ => false,
        })
    }

    /// 本次会话中 `update_references` 改写过的引用字段数（重置或复制后归零）
    pub fn updated_references(&self, record: RecordId) -> Result<usize> {
        Ok(self.records.get(record)?.updated_references)
    }

    /// 冲突的版本；`extended` 为真时与最终版本比较，否则只看相邻版本
    pub fn conflicts(&self, global: GlobalId, extended: bool) -> Result<Vec<RecordId>> {
        let report = self.conflict_report(global)?;
        Ok(if extended { report.extended } else { report.direct })
    }

    /// 完整的冲突报告
    pub fn conflict_report(&self, global: GlobalId) -> Result<ConflictReport> {
        let key = self.form_key(global)?;
        let history = self.overrides(key).to_vec();
        let chain = self.chain(key)?;
        let classes = classify_chain(&chain);

        let pick = |indices: &[usize]| indices.iter().map(|&i| history[i]).collect::<Vec<_>>();
        let plugin_name = |rid: RecordId| -> Result<String> {
            let record = self.records.get(rid)?;
            Ok(self.plugins.get(record.plugin)?.name.clone())
        };

        Ok(ConflictReport {
            form_id: global,
            plugins: history.iter().map(|&rid| plugin_name(rid)).collect::<Result<_>>()?,
            winning_plugin: classes.winner.map(|i| plugin_name(history[i])).transpose()?,
            conflicting_plugins: classes
                .extended
                .iter()
                .map(|&i| plugin_name(history[i]))
                .collect::<Result<_>>()?,
            winner: classes.winner.map(|i| history[i]),
            identical_to_master: pick(&classes.identical_to_master),
            direct: pick(&classes.direct),
            extended: pick(&classes.extended),
            history,
        })
    }

    /// 插件中与紧邻前一个版本完全相同的覆盖记录
    pub fn identical_to_master(&self, plugin: PluginId) -> Result<Vec<RecordId>> {
        let owner = self.plugins.get(plugin)?;
        let mut identical = Vec::new();
        for rid in owner.record_ids() {
            let Some(key) = self.records.get(rid)?.key else { continue };
            let chain_ids = self.overrides(key);
            let Some(position) = chain_ids.iter().position(|&r| r == rid) else { continue };
            if position == 0 {
                continue;
            }
            let current = self.records.get(rid)?;
            let previous = self.records.get(chain_ids[position - 1])?;
            if same_content(current, previous) {
                identical.push(rid);
            }
        }
        Ok(identical)
    }

    /// 所有有冲突的对象（按 GlobalId 排序）
    pub fn all_conflicts(&self, extended: bool) -> Result<Vec<ConflictReport>> {
        let mut keys: Vec<(GlobalId, FormKey)> = self
            .index
            .iter()
            .filter(|(_, chain)| chain.len() > 1)
            .map(|(&key, _)| self.global_id(key).map(|global| (global, key)))
            .collect::<Result<_>>()?;
        keys.sort_by_key(|(global, _)| *global);

        let mut reports = Vec::new();
        for (global, _) in keys {
            let report = self.conflict_report(global)?;
            let conflicting = if extended { &report.extended } else { &report.direct };
            if !conflicting.is_empty() {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    /// 把指向 `old[i]` 的引用字段改写为 `new[i]`，返回每条被改写记录的字段路径
    pub fn update_references(
        &mut self,
        scope: ReferenceScope,
        old: &[GlobalId],
        new: &[GlobalId],
    ) -> Result<Vec<ReferenceUpdate>> {
        let result = self.try_update_references(scope, old, new);
        self.traced("update_references", result)
    }

    fn try_update_references(
        &mut self,
        scope: ReferenceScope,
        old: &[GlobalId],
        new: &[GlobalId],
    ) -> Result<Vec<ReferenceUpdate>> {
        if old.len() != new.len() {
            return Err(EspError::InvalidArgument(format!(
                "{} old ids but {} new ids", old.len(), new.len()
            )));
        }
        let mapping: HashMap<FormKey, FormKey> = old
            .iter()
            .zip(new)
            .map(|(&from, &to)| Ok((self.form_key(from)?, self.form_key(to)?)))
            .collect::<Result<_>>()?;

        let (plugin, targets) = match scope {
            ReferenceScope::Record(rid) => (self.records.get(rid)?.plugin, vec![rid]),
            ReferenceScope::Plugin(plugin) => (plugin, self.plugins.get(plugin)?.record_ids()),
        };
        let owner = self.plugins.get(plugin)?;
        if !owner.is_saveable() {
            return Err(EspError::ReadOnly(owner.name.clone()));
        }

        let mut updates = Vec::new();
        for rid in targets {
            let record = self.records.get_mut(rid)?;
            let Some(fields) = record.fields_mut() else { continue };

            let mut changed = Vec::new();
            fields.visit_form_refs_mut(&mut |path, form| {
                if let FormRef::Resolved(key) = form {
                    if let Some(&replacement) = mapping.get(&*key) {
                        *form = FormRef::Resolved(replacement);
                        changed.push(path.clone());
                    }
                }
            });

            if !changed.is_empty() {
                record.mark_modified();
                record.updated_references += changed.len();
                updates.push(ReferenceUpdate { record: rid, fields: changed });
            }
        }

        if !updates.is_empty() {
            self.plugins.get_mut(plugin)?.mark_dirty();
            tracing::debug!(records = updates.len(), "references updated");
        }
        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::datatypes::{GameType, ModFlags};
    use crate::plugin::Plugin;
    use crate::schema::{FieldValue, RecordType, Scalar};

    fn glob(value: f32, deleted: bool) -> Record {
        let mut plugins = Arena::new();
        let plugin = plugins.insert(Plugin::new("T.esp".into(), ModFlags::empty(), GameType::Skyrim));
        let mut record = Record::new(RecordType::Glob, plugin, FormKey::new(plugin, 0x800), GameType::Skyrim);
        record
            .fields_mut()
            .unwrap()
            .set_path(&b"FLTV".into(), FieldValue::Struct(vec![Scalar::F32(value)]))
            .unwrap();
        if deleted {
            record.mark_deleted();
        }
        record
    }

    fn classify(chain: &[Record]) -> ChainClassification {
        classify_chain(&chain.iter().collect::<Vec<_>>())
    }

    #[test]
    fn test_single_override() {
        let c = classify(&[glob(1.0, false), glob(2.0, false)]);
        assert_eq!(c.winner, Some(1));
        assert_eq!(c.source, Some(1));
        assert_eq!(c.direct, vec![1]);
        assert_eq!(c.extended, vec![1]);
        assert!(c.identical_to_master.is_empty());
    }

    #[test]
    fn test_identical_copy_is_not_a_conflict() {
        let c = classify(&[glob(1.0, false), glob(2.0, false), glob(2.0, false)]);
        assert_eq!(c.winner, Some(2));
        assert_eq!(c.source, Some(1));
        assert_eq!(c.identical_to_master, vec![2]);
        assert_eq!(c.direct, vec![1]);
        // B 引入了最终内容
        assert_eq!(c.extended, vec![1]);
    }

    #[test]
    fn test_overridden_change_is_extended_conflict() {
        let c = classify(&[glob(1.0, false), glob(2.0, false), glob(3.0, false)]);
        assert_eq!(c.direct, vec![1, 2]);
        assert_eq!(c.extended, vec![1, 2]);
    }

    #[test]
    fn test_revert_to_base() {
        // C 恢复了 A 的值：只和紧邻的 B 比较，所以 C 不算与主文件相同
        let c = classify(&[glob(1.0, false), glob(2.0, false), glob(1.0, false)]);
        assert!(c.identical_to_master.is_empty());
        assert_eq!(c.direct, vec![1, 2]);
        assert_eq!(c.extended, vec![1, 2]);
    }

    #[test]
    fn test_agreeing_override_is_only_direct() {
        // B 和 D 都设为 2，C 改成 3，D 胜出
        let c = classify(&[glob(1.0, false), glob(2.0, false), glob(3.0, false), glob(2.0, false)]);
        assert_eq!(c.direct, vec![1, 2, 3]);
        assert_eq!(c.extended, vec![2, 3]);
    }

    #[test]
    fn test_tombstone_has_no_winner() {
        let c = classify(&[glob(1.0, false), glob(1.0, true)]);
        assert_eq!(c.winner, None);
        assert_eq!(c.source, None);
        assert_eq!(c.direct, vec![1]);
        assert_eq!(c.extended, vec![1]);
    }

    #[test]
    fn test_base_only() {
        let c = classify(&[glob(1.0, false)]);
        assert_eq!(c.winner, Some(0));
        assert_eq!(c.source, Some(0));
        assert!(c.direct.is_empty() && c.extended.is_empty());
        assert_eq!(classify(&[]), ChainClassification::default());
    }
}
