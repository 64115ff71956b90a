//! 调度定义的管理与持久化
//!
//! 调度节点 `/gyrex/jobs/schedules/{id}` 保存 [`ScheduleData`]，条目也在其中。
//! 所有写入都带版本校验，并发修改会以版本冲突的形式返回给调用方。
//!
//! 启用中的调度不可修改：添加、删除条目或修改参数之前必须先禁用。
//! 启用标志与条目位于同一节点，检查与写入之间被其他节点启用时，
//! 版本校验会拒绝这次修改。

use std::sync::Arc;

use scheduler_core::ids::validate_id;
use scheduler_core::models::{ScheduleData, ScheduleDefinition, ScheduleEntry};
use scheduler_core::paths;
use scheduler_core::traits::{optional, CoordinationStore, CreateMode, JobProviderLookup};
use scheduler_core::{SchedulerError, SchedulerResult};
use tracing::{debug, info};

use crate::cron_utils::{validate_cron_expression, validate_timezone};

#[derive(Clone)]
pub struct ScheduleManager {
    store: Arc<dyn CoordinationStore>,
    providers: Arc<dyn JobProviderLookup>,
}

impl ScheduleManager {
    pub fn new(store: Arc<dyn CoordinationStore>, providers: Arc<dyn JobProviderLookup>) -> Self {
        Self { store, providers }
    }

    pub async fn create_schedule(&self, schedule_id: &str) -> SchedulerResult<ScheduleDefinition> {
        self.create_schedule_in_context(schedule_id, "/").await
    }

    pub async fn create_schedule_in_context(
        &self,
        schedule_id: &str,
        context_path: &str,
    ) -> SchedulerResult<ScheduleDefinition> {
        let mut schedule = ScheduleDefinition::new(schedule_id)?;
        scheduler_core::ids::validate_context_path(context_path)?;
        schedule.context_path = context_path.to_string();
        let data = serde_json::to_vec(&schedule.data())?;
        match self
            .store
            .create_path(&paths::schedule_path(schedule_id), CreateMode::Persistent, data)
            .await
        {
            Ok(_) => {}
            Err(SchedulerError::Store(e)) if e.is_node_exists() => {
                return Err(SchedulerError::DuplicateSchedule(schedule_id.to_string()))
            }
            Err(e) => return Err(e),
        }
        info!("创建调度: {}", schedule_id);
        schedule.version = 0;
        Ok(schedule)
    }

    /// 读取完整的调度定义（含条目）
    pub async fn get_schedule(&self, schedule_id: &str) -> SchedulerResult<Option<ScheduleDefinition>> {
        validate_id(schedule_id, "调度ID")?;
        let path = paths::schedule_path(schedule_id);
        let Some((bytes, stat)) = optional(self.store.read_record(&path).await)? else {
            return Ok(None);
        };
        let data: ScheduleData = serde_json::from_slice(&bytes)?;
        Ok(Some(ScheduleDefinition::from_data(schedule_id, data, stat.version)))
    }

    async fn require_schedule(&self, schedule_id: &str) -> SchedulerResult<ScheduleDefinition> {
        self.get_schedule(schedule_id)
            .await?
            .ok_or_else(|| SchedulerError::ScheduleNotFound(schedule_id.to_string()))
    }

    async fn require_modifiable(&self, schedule_id: &str) -> SchedulerResult<ScheduleDefinition> {
        let schedule = self.require_schedule(schedule_id).await?;
        if schedule.enabled {
            return Err(SchedulerError::ScheduleEnabled(schedule_id.to_string()));
        }
        Ok(schedule)
    }

    pub async fn list_schedules(&self) -> SchedulerResult<Vec<String>> {
        Ok(optional(self.store.read_children_names(paths::SCHEDULES_ROOT).await)?.unwrap_or_default())
    }

    pub async fn remove_schedule(&self, schedule_id: &str) -> SchedulerResult<()> {
        validate_id(schedule_id, "调度ID")?;
        match self.store.delete_path(&paths::schedule_path(schedule_id), None).await {
            Ok(()) => {
                info!("删除调度: {}", schedule_id);
                Ok(())
            }
            Err(e) if e.is_no_node() => Err(SchedulerError::ScheduleNotFound(schedule_id.to_string())),
            Err(e) => Err(e),
        }
    }

    /// 启用前校验所有条目的CRON表达式与作业类型
    pub async fn enable_schedule(&self, schedule_id: &str) -> SchedulerResult<ScheduleDefinition> {
        let mut schedule = self.require_schedule(schedule_id).await?;
        validate_timezone(&schedule.timezone)?;
        for entry in schedule.entries.values() {
            validate_cron_expression(&entry.cron_expression)?;
            self.check_provider(&entry.job_type_id)?;
        }
        schedule.enabled = true;
        self.write_data(&mut schedule).await?;
        info!("启用调度: {}", schedule_id);
        Ok(schedule)
    }

    pub async fn disable_schedule(&self, schedule_id: &str) -> SchedulerResult<ScheduleDefinition> {
        let mut schedule = self.require_schedule(schedule_id).await?;
        schedule.enabled = false;
        self.write_data(&mut schedule).await?;
        info!("禁用调度: {}", schedule_id);
        Ok(schedule)
    }

    pub async fn set_timezone(&self, schedule_id: &str, timezone: &str) -> SchedulerResult<()> {
        validate_timezone(timezone)?;
        let mut schedule = self.require_modifiable(schedule_id).await?;
        schedule.timezone = timezone.to_string();
        self.write_data(&mut schedule).await
    }

    /// 设置触发时投递的队列，None 表示使用默认队列
    ///
    /// Worker 只消费自身配置的 `queue.default_queue_id`。投递到其他队列的作业
    /// 需要另起一组 Worker，并把它们的 `queue.default_queue_id` 配成该队列，
    /// 否则消息会一直留在队列里。
    pub async fn set_queue_id(&self, schedule_id: &str, queue_id: Option<&str>) -> SchedulerResult<()> {
        if let Some(queue_id) = queue_id {
            validate_id(queue_id, "队列ID")?;
        }
        let mut schedule = self.require_modifiable(schedule_id).await?;
        schedule.queue_id = queue_id.map(str::to_string);
        self.write_data(&mut schedule).await
    }

    pub async fn add_entry(&self, schedule_id: &str, entry: ScheduleEntry) -> SchedulerResult<()> {
        validate_id(&entry.id, "条目ID")?;
        validate_cron_expression(&entry.cron_expression)?;
        self.check_provider(&entry.job_type_id)?;
        let mut schedule = self.require_modifiable(schedule_id).await?;
        if schedule.entries.contains_key(&entry.id) {
            return Err(SchedulerError::DuplicateEntry {
                schedule_id: schedule_id.to_string(),
                entry_id: entry.id,
            });
        }
        let entry_id = entry.id.clone();
        schedule.entries.insert(entry_id.clone(), entry);
        self.write_data(&mut schedule).await?;
        debug!("调度 {} 添加条目 {}", schedule_id, entry_id);
        Ok(())
    }

    pub async fn remove_entry(&self, schedule_id: &str, entry_id: &str) -> SchedulerResult<()> {
        let mut schedule = self.require_modifiable(schedule_id).await?;
        if schedule.entries.remove(entry_id).is_none() {
            return Err(SchedulerError::EntryNotFound {
                schedule_id: schedule_id.to_string(),
                entry_id: entry_id.to_string(),
            });
        }
        self.write_data(&mut schedule).await
    }

    pub async fn set_entry_cron(
        &self,
        schedule_id: &str,
        entry_id: &str,
        cron_expression: &str,
    ) -> SchedulerResult<()> {
        validate_cron_expression(cron_expression)?;
        self.modify_entry(schedule_id, entry_id, |entry| {
            entry.cron_expression = cron_expression.trim().to_string();
        })
        .await
    }

    pub async fn set_entry_job_type(
        &self,
        schedule_id: &str,
        entry_id: &str,
        job_type_id: &str,
    ) -> SchedulerResult<()> {
        validate_id(job_type_id, "作业类型")?;
        self.check_provider(job_type_id)?;
        self.modify_entry(schedule_id, entry_id, |entry| {
            entry.job_type_id = job_type_id.to_string();
        })
        .await
    }

    /// `value` 为 None 时删除参数
    pub async fn set_entry_parameter(
        &self,
        schedule_id: &str,
        entry_id: &str,
        key: &str,
        value: Option<&str>,
    ) -> SchedulerResult<()> {
        if key.trim().is_empty() {
            return Err(SchedulerError::invalid_id("参数名不能为空"));
        }
        self.modify_entry(schedule_id, entry_id, |entry| match value {
            Some(v) => {
                entry.job_parameters.insert(key.to_string(), v.to_string());
            }
            None => {
                entry.job_parameters.remove(key);
            }
        })
        .await
    }

    async fn modify_entry<F>(&self, schedule_id: &str, entry_id: &str, f: F) -> SchedulerResult<()>
    where
        F: FnOnce(&mut ScheduleEntry),
    {
        let mut schedule = self.require_modifiable(schedule_id).await?;
        let entry = schedule
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| SchedulerError::EntryNotFound {
                schedule_id: schedule_id.to_string(),
                entry_id: entry_id.to_string(),
            })?;
        f(entry);
        self.write_data(&mut schedule).await
    }

    fn check_provider(&self, job_type_id: &str) -> SchedulerResult<()> {
        if self.providers.has_provider(job_type_id) {
            Ok(())
        } else {
            Err(SchedulerError::JobProviderNotFound(job_type_id.to_string()))
        }
    }

    async fn write_data(&self, schedule: &mut ScheduleDefinition) -> SchedulerResult<()> {
        let stat = self
            .store
            .write_record(
                &paths::schedule_path(&schedule.id),
                serde_json::to_vec(&schedule.data())?,
                Some(schedule.version),
            )
            .await?;
        schedule.version = stat.version;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_infrastructure::InMemoryCoordinationStore;
    use scheduler_testing_utils::{FailingStore, StaticProviderLookup};

    fn manager() -> ScheduleManager {
        ScheduleManager::new(
            Arc::new(InMemoryCoordinationStore::new()),
            Arc::new(StaticProviderLookup::new(["report.daily", "cleanup"])),
        )
    }

    #[tokio::test]
    async fn test_create_and_load_schedule() {
        let manager = manager();
        manager.create_schedule("s1").await.unwrap();
        assert!(matches!(
            manager.create_schedule("s1").await.unwrap_err(),
            SchedulerError::DuplicateSchedule(_)
        ));

        let entry = ScheduleEntry::new("e1", "0 9 * * MON-FRI", "report.daily")
            .unwrap()
            .with_parameter("format", "pdf");
        manager.add_entry("s1", entry.clone()).await.unwrap();
        manager.set_timezone("s1", "Europe/Berlin").await.unwrap();
        manager.set_queue_id("s1", Some("reports")).await.unwrap();

        let loaded = manager.get_schedule("s1").await.unwrap().unwrap();
        assert_eq!(loaded.entry("e1"), Some(&entry));
        assert_eq!(loaded.timezone, "Europe/Berlin");
        assert_eq!(loaded.queue_id.as_deref(), Some("reports"));
        assert!(!loaded.enabled);
        assert_eq!(manager.list_schedules().await.unwrap(), vec!["s1"]);
    }

    #[tokio::test]
    async fn test_enabled_schedule_rejects_modification() {
        let manager = manager();
        manager.create_schedule("s1").await.unwrap();
        manager
            .add_entry("s1", ScheduleEntry::new("e1", "* * * * *", "cleanup").unwrap())
            .await
            .unwrap();
        manager.enable_schedule("s1").await.unwrap();

        let add = manager
            .add_entry("s1", ScheduleEntry::new("e2", "* * * * *", "cleanup").unwrap())
            .await;
        assert!(matches!(add, Err(SchedulerError::ScheduleEnabled(_))));
        let param = manager.set_entry_parameter("s1", "e1", "k", Some("v")).await;
        assert!(matches!(param, Err(SchedulerError::ScheduleEnabled(_))));
        assert!(matches!(
            manager.remove_entry("s1", "e1").await,
            Err(SchedulerError::ScheduleEnabled(_))
        ));

        manager.disable_schedule("s1").await.unwrap();
        manager.set_entry_parameter("s1", "e1", "k", Some("v")).await.unwrap();
        let loaded = manager.get_schedule("s1").await.unwrap().unwrap();
        assert_eq!(loaded.entry("e1").unwrap().job_parameters.get("k").unwrap(), "v");
    }

    #[tokio::test]
    async fn test_configuration_errors_rejected_at_boundary() {
        let manager = manager();
        manager.create_schedule("s1").await.unwrap();

        let bad_cron = ScheduleEntry::new("e1", "not a cron", "cleanup").unwrap();
        assert!(matches!(
            manager.add_entry("s1", bad_cron).await,
            Err(SchedulerError::InvalidCron { .. })
        ));
        let unknown_type = ScheduleEntry::new("e1", "* * * * *", "unknown").unwrap();
        assert!(matches!(
            manager.add_entry("s1", unknown_type).await,
            Err(SchedulerError::JobProviderNotFound(_))
        ));
        assert!(matches!(
            manager.set_timezone("s1", "Nowhere/City").await,
            Err(SchedulerError::InvalidTimezone(_))
        ));
        assert!(matches!(
            manager.create_schedule("bad id").await,
            Err(SchedulerError::InvalidId(_))
        ));
        assert!(matches!(
            manager.enable_schedule("missing").await,
            Err(SchedulerError::ScheduleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_entry_crud() {
        let manager = manager();
        manager.create_schedule("s1").await.unwrap();
        let entry = ScheduleEntry::new("e1", "* * * * *", "cleanup").unwrap();
        manager.add_entry("s1", entry.clone()).await.unwrap();
        assert!(matches!(
            manager.add_entry("s1", entry).await,
            Err(SchedulerError::DuplicateEntry { .. })
        ));

        manager.set_entry_cron("s1", "e1", "0 3 * * *").await.unwrap();
        manager.set_entry_job_type("s1", "e1", "report.daily").await.unwrap();
        manager.set_entry_parameter("s1", "e1", "a", Some("1")).await.unwrap();
        manager.set_entry_parameter("s1", "e1", "a", None).await.unwrap();

        let loaded = manager.get_schedule("s1").await.unwrap().unwrap();
        let e1 = loaded.entry("e1").unwrap();
        assert_eq!(e1.cron_expression, "0 3 * * *");
        assert_eq!(e1.job_type_id, "report.daily");
        assert!(e1.job_parameters.is_empty());

        manager.remove_entry("s1", "e1").await.unwrap();
        assert!(matches!(
            manager.remove_entry("s1", "e1").await,
            Err(SchedulerError::EntryNotFound { .. })
        ));
        manager.remove_schedule("s1").await.unwrap();
        assert!(manager.get_schedule("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_modification_is_contention() {
        let manager = manager();
        manager.create_schedule("s1").await.unwrap();
        let mut stale = manager.get_schedule("s1").await.unwrap().unwrap();
        manager.set_timezone("s1", "Asia/Tokyo").await.unwrap();

        stale.enabled = true;
        let err = manager.write_data(&mut stale).await.unwrap_err();
        assert!(err.is_contention());
    }

    #[tokio::test]
    async fn test_enable_between_check_and_write_rejects_entry_change() {
        let store = Arc::new(FailingStore::new(Arc::new(InMemoryCoordinationStore::new())));
        let manager = ScheduleManager::new(store.clone(), Arc::new(StaticProviderLookup::new(["cleanup"])));
        manager.create_schedule("s1").await.unwrap();
        manager
            .add_entry("s1", ScheduleEntry::new("e1", "* * * * *", "cleanup").unwrap())
            .await
            .unwrap();

        let mut enabled = manager.get_schedule("s1").await.unwrap().unwrap();
        enabled.enabled = true;
        let enabled_data = serde_json::to_vec(&enabled.data()).unwrap();

        // 另一个节点在本次读取之后立即启用调度
        store.write_after_read(&paths::schedule_path("s1"), enabled_data.clone());
        let err = manager
            .add_entry("s1", ScheduleEntry::new("e2", "* * * * *", "cleanup").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_contention());

        let loaded = manager.get_schedule("s1").await.unwrap().unwrap();
        assert!(loaded.enabled);
        assert_eq!(loaded.entries.keys().cloned().collect::<Vec<_>>(), vec!["e1"]);

        manager.disable_schedule("s1").await.unwrap();
        store.write_after_read(&paths::schedule_path("s1"), enabled_data.clone());
        let err = manager
            .set_entry_parameter("s1", "e1", "k", Some("v"))
            .await
            .unwrap_err();
        assert!(err.is_contention());

        manager.disable_schedule("s1").await.unwrap();
        store.write_after_read(&paths::schedule_path("s1"), enabled_data);
        assert!(manager.remove_entry("s1", "e1").await.unwrap_err().is_contention());

        let loaded = manager.get_schedule("s1").await.unwrap().unwrap();
        assert!(loaded.enabled);
        let e1 = loaded.entry("e1").unwrap();
        assert!(e1.job_parameters.is_empty());
    }
}
