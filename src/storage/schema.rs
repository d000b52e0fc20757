//! Database schema, expressed as named steps.
//!
//! Each step has a stable name that the migrator records in
//! `schema_history`; adding a step means appending here with a fresh
//! name. The unique constraint on `generated_applications
//! (model, app_number)` is the foundation of app number allocation; the
//! partial unique index on main tasks is what makes duplicate analysis
//! submission impossible even on the retry path.

/// One named DDL statement.
#[derive(Debug, Clone, Copy)]
pub struct SchemaStep {
    /// Stable identifier recorded in `schema_history`. Never rename.
    pub name: &'static str,
    /// The statement itself.
    pub sql: &'static str,
}

/// Every schema step, in application order.
pub fn schema_steps() -> &'static [SchemaStep] {
    const STEPS: &[SchemaStep] = &[
        SchemaStep {
            name: "create_pipeline_executions",
            sql: r#"
            CREATE TABLE IF NOT EXISTS pipeline_executions (
                id UUID PRIMARY KEY,
                status TEXT NOT NULL,
                current_stage TEXT NOT NULL,
                current_job_index BIGINT NOT NULL DEFAULT 0,
                config_json JSONB NOT NULL,
                progress_json JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        },
        SchemaStep {
            name: "index_pipeline_status",
            sql: r#"
            CREATE INDEX IF NOT EXISTS idx_pipeline_executions_status
                ON pipeline_executions (status)
            "#,
        },
        SchemaStep {
            name: "create_analysis_tasks",
            sql: r#"
            CREATE TABLE IF NOT EXISTS analysis_tasks (
                task_id UUID PRIMARY KEY,
                pipeline_id UUID NOT NULL,
                parent_task_id UUID REFERENCES analysis_tasks(task_id) ON DELETE CASCADE,
                is_main_task BOOLEAN NOT NULL,
                model TEXT NOT NULL,
                app_number INTEGER NOT NULL,
                service_name TEXT,
                tools_json JSONB NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        },
        SchemaStep {
            name: "index_task_app",
            sql: r#"
            CREATE INDEX IF NOT EXISTS idx_analysis_tasks_app
                ON analysis_tasks (model, app_number, is_main_task)
            "#,
        },
        SchemaStep {
            name: "index_task_parent",
            sql: r#"
            CREATE INDEX IF NOT EXISTS idx_analysis_tasks_parent
                ON analysis_tasks (parent_task_id)
            "#,
        },
        SchemaStep {
            name: "index_task_status",
            sql: r#"
            CREATE INDEX IF NOT EXISTS idx_analysis_tasks_status
                ON analysis_tasks (status)
            "#,
        },
        SchemaStep {
            name: "unique_main_task",
            sql: r#"
            CREATE UNIQUE INDEX IF NOT EXISTS uq_analysis_tasks_main
                ON analysis_tasks (pipeline_id, model, app_number)
                WHERE is_main_task
            "#,
        },
        SchemaStep {
            name: "create_generated_applications",
            sql: r#"
            CREATE TABLE IF NOT EXISTS generated_applications (
                model TEXT NOT NULL,
                app_number INTEGER NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (model, app_number)
            )
            "#,
        },
    ];
    STEPS
}
