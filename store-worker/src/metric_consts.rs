pub const EVENTS_FAILED: &str = "store_events_failed_total";
pub const TIME_TO_PROCESS: &str = "store_events_time_to_process_seconds";
pub const STAGE_DURATION: &str = "store_stage_duration_seconds";
pub const PLUGIN_ERRORS: &str = "store_plugin_errors_total";
pub const SETTINGS_CACHE: &str = "store_settings_cache";
pub const ATTACHMENTS_SKIPPED: &str = "store_attachments_skipped_total";
pub const EVENTS_DIVERTED: &str = "store_events_diverted_total";
pub const PIPELINE_RESTARTS: &str = "store_pipeline_restarts_total";
pub const TASKS_TOTAL: &str = "store_tasks_total";
pub const TASKS_COMPLETED: &str = "store_tasks_completed";
pub const TASKS_FAILED: &str = "store_tasks_failed";
pub const TASKS_TIMED_OUT: &str = "store_tasks_timed_out";
pub const TASKS_RETRIED: &str = "store_tasks_retried";
pub const WORKER_SATURATION: &str = "store_worker_saturation_percent";
pub const TASK_DURATION: &str = "store_task_duration_seconds";
