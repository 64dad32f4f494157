//! Table definition for stored tasks.

/// Idempotent DDL run by [`crate::PgTaskStore::migrate`].
pub const CREATE_TASKS: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id          BIGSERIAL PRIMARY KEY,
    name        TEXT        NOT NULL,
    quantity    BIGINT      NOT NULL,
    retry_count INTEGER     NOT NULL DEFAULT 0,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

pub const INSERT_TASK: &str = r#"
INSERT INTO tasks (name, quantity, retry_count)
VALUES ($1, $2, $3)
RETURNING id
"#;

pub const SELECT_TASKS: &str = r#"
SELECT id, name, quantity, retry_count, created_at
FROM tasks
ORDER BY id
"#;
