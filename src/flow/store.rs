//! Flow persistence. Step claims and signal consumption are conditional
//! updates — the affected-row count, not a prior read, decides who wins a
//! race.

use std::collections::BTreeMap;

use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::model::{Blockchain, Corridor, CryptoCurrency, FiatCurrency};

use super::{
    FlowDefinition, FlowInstance, FlowSnapshot, FlowStatus, FlowStepInstance, InboundSignal,
    StepStatus, StepType,
};

fn parse_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    what: &str,
) -> Result<T, PersistenceError> {
    serde_json::from_str(raw).map_err(|e| PersistenceError::Corrupt(format!("{what}: {e}")))
}

fn row_to_definition(row: &SqliteRow) -> Result<FlowDefinition, PersistenceError> {
    let blockchain: String = row.try_get("blockchain")?;
    let crypto_currency: String = row.try_get("crypto_currency")?;
    let target_currency: String = row.try_get("target_currency")?;
    let steps_json: String = row.try_get("steps")?;

    Ok(FlowDefinition {
        id: row.try_get("id")?,
        corridor: Corridor {
            blockchain: blockchain.parse::<Blockchain>()?,
            crypto_currency: crypto_currency.parse::<CryptoCurrency>()?,
            target_currency: target_currency.parse::<FiatCurrency>()?,
        },
        fee_bps: row.try_get("fee_bps")?,
        enabled: row.try_get("enabled")?,
        steps: parse_json(&steps_json, "flow definition steps")?,
    })
}

fn row_to_instance(row: &SqliteRow) -> Result<FlowInstance, PersistenceError> {
    let status: String = row.try_get("status")?;
    let snapshot_json: String = row.try_get("snapshot")?;

    Ok(FlowInstance {
        id: row.try_get("id")?,
        transaction_id: row.try_get("transaction_id")?,
        definition_id: row.try_get("definition_id")?,
        status: status.parse::<FlowStatus>()?,
        current_step_order: row.try_get("current_step_order")?,
        snapshot: parse_json::<FlowSnapshot>(&snapshot_json, "flow snapshot")?,
    })
}

fn row_to_step(row: &SqliteRow) -> Result<FlowStepInstance, PersistenceError> {
    let status: String = row.try_get("status")?;
    let step_type: String = row.try_get("step_type")?;
    let correlation: Option<String> = row.try_get("correlation")?;
    let config: String = row.try_get("config")?;
    let input: Option<String> = row.try_get("input")?;
    let output: Option<String> = row.try_get("output")?;

    Ok(FlowStepInstance {
        id: row.try_get("id")?,
        flow_instance_id: row.try_get("flow_instance_id")?,
        step_order: row.try_get("step_order")?,
        step_type: step_type.parse::<StepType>()?,
        status: status.parse::<StepStatus>()?,
        attempts: row.try_get("attempts")?,
        correlation: correlation
            .map(|raw| parse_json(&raw, "step correlation"))
            .transpose()?,
        config: parse_json(&config, "step config")?,
        input: input.map(|raw| parse_json(&raw, "step input")).transpose()?,
        output: output
            .map(|raw| parse_json(&raw, "step output"))
            .transpose()?,
        error: row.try_get("error")?,
    })
}

const STEP_COLUMNS: &str = r#"
    SELECT id, flow_instance_id, step_order, step_type, status, attempts,
           correlation, config, input, output, error
    FROM flow_step_instances
"#;

pub async fn insert_definition(
    pool: &SqlitePool,
    definition: &FlowDefinition,
) -> Result<(), PersistenceError> {
    let steps_json = serde_json::to_string(&definition.steps)
        .map_err(|e| PersistenceError::Corrupt(format!("flow definition steps: {e}")))?;

    sqlx::query(
        r#"
        INSERT INTO flow_definitions
            (id, blockchain, crypto_currency, target_currency, fee_bps, enabled, steps)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(definition.id)
    .bind(definition.corridor.blockchain.as_str())
    .bind(definition.corridor.crypto_currency.as_str())
    .bind(definition.corridor.target_currency.as_str())
    .bind(definition.fee_bps)
    .bind(definition.enabled)
    .bind(&steps_json)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn find_enabled_definition(
    pool: &SqlitePool,
    corridor: &Corridor,
) -> Result<Option<FlowDefinition>, PersistenceError> {
    let row = sqlx::query(
        r#"
        SELECT id, blockchain, crypto_currency, target_currency, fee_bps, enabled, steps
        FROM flow_definitions
        WHERE blockchain = ?1 AND crypto_currency = ?2 AND target_currency = ?3
          AND enabled = 1
        "#,
    )
    .bind(corridor.blockchain.as_str())
    .bind(corridor.crypto_currency.as_str())
    .bind(corridor.target_currency.as_str())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_definition).transpose()
}

/// Inserts config-declared definitions for corridors that have none yet.
pub async fn seed_definitions(
    pool: &SqlitePool,
    definitions: &[FlowDefinition],
) -> Result<usize, PersistenceError> {
    let mut seeded = 0;

    for definition in definitions {
        if find_enabled_definition(pool, &definition.corridor)
            .await?
            .is_none()
        {
            insert_definition(pool, definition).await?;
            seeded += 1;
        }
    }

    Ok(seeded)
}

/// Creates the instance and its step rows in one transaction. A unique
/// violation on transaction_id means another worker created the instance
/// first; callers resume that one instead.
pub async fn create_instance(
    pool: &SqlitePool,
    instance: &FlowInstance,
    steps: &[FlowStepInstance],
) -> Result<(), PersistenceError> {
    let snapshot_json = serde_json::to_string(&instance.snapshot)
        .map_err(|e| PersistenceError::Corrupt(format!("flow snapshot: {e}")))?;

    let mut sql_tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO flow_instances
            (id, transaction_id, definition_id, status, current_step_order, snapshot)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(instance.id)
    .bind(instance.transaction_id)
    .bind(instance.definition_id)
    .bind(instance.status.as_str())
    .bind(instance.current_step_order)
    .bind(&snapshot_json)
    .execute(&mut *sql_tx)
    .await?;

    for step in steps {
        let correlation_json = step
            .correlation
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| PersistenceError::Corrupt(format!("step correlation: {e}")))?;
        let config_json = serde_json::to_string(&step.config)
            .map_err(|e| PersistenceError::Corrupt(format!("step config: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO flow_step_instances
                (id, flow_instance_id, step_order, step_type, status, attempts,
                 correlation, config)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(step.id)
        .bind(step.flow_instance_id)
        .bind(step.step_order)
        .bind(step.step_type.as_str())
        .bind(step.status.as_str())
        .bind(step.attempts)
        .bind(&correlation_json)
        .bind(&config_json)
        .execute(&mut *sql_tx)
        .await?;
    }

    sql_tx.commit().await?;
    Ok(())
}

pub async fn find_instance(
    pool: &SqlitePool,
    instance_id: Uuid,
) -> Result<Option<FlowInstance>, PersistenceError> {
    let row = sqlx::query(
        r#"
        SELECT id, transaction_id, definition_id, status, current_step_order, snapshot
        FROM flow_instances
        WHERE id = ?1
        "#,
    )
    .bind(instance_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_instance).transpose()
}

pub async fn find_instance_by_transaction(
    pool: &SqlitePool,
    transaction_id: Uuid,
) -> Result<Option<FlowInstance>, PersistenceError> {
    let row = sqlx::query(
        r#"
        SELECT id, transaction_id, definition_id, status, current_step_order, snapshot
        FROM flow_instances
        WHERE transaction_id = ?1
        "#,
    )
    .bind(transaction_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_instance).transpose()
}

pub async fn set_instance_state(
    pool: &SqlitePool,
    instance_id: Uuid,
    status: FlowStatus,
    current_step_order: Option<i64>,
) -> Result<(), PersistenceError> {
    sqlx::query(
        r#"
        UPDATE flow_instances
        SET status = ?2, current_step_order = ?3, updated_at = CURRENT_TIMESTAMP
        WHERE id = ?1
        "#,
    )
    .bind(instance_id)
    .bind(status.as_str())
    .bind(current_step_order)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn find_step(
    pool: &SqlitePool,
    instance_id: Uuid,
    step_order: i64,
) -> Result<Option<FlowStepInstance>, PersistenceError> {
    let row = sqlx::query(&format!(
        "{STEP_COLUMNS} WHERE flow_instance_id = ?1 AND step_order = ?2"
    ))
    .bind(instance_id)
    .bind(step_order)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_step).transpose()
}

pub async fn waiting_steps(
    pool: &SqlitePool,
    instance_id: Uuid,
) -> Result<Vec<FlowStepInstance>, PersistenceError> {
    let rows = sqlx::query(&format!(
        "{STEP_COLUMNS} WHERE flow_instance_id = ?1 AND status = 'WAITING' ORDER BY step_order ASC"
    ))
    .bind(instance_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_step).collect()
}

/// READY → RUNNING. The claim also counts the attempt.
pub async fn claim_step(pool: &SqlitePool, step_id: Uuid) -> Result<bool, PersistenceError> {
    let result = sqlx::query(
        r#"
        UPDATE flow_step_instances
        SET status = 'RUNNING', attempts = attempts + 1, updated_at = CURRENT_TIMESTAMP
        WHERE id = ?1 AND status = 'READY'
        "#,
    )
    .bind(step_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn set_step_input(
    pool: &SqlitePool,
    step_id: Uuid,
    input: &serde_json::Value,
) -> Result<(), PersistenceError> {
    let input_json = serde_json::to_string(input)
        .map_err(|e| PersistenceError::Corrupt(format!("step input: {e}")))?;

    sqlx::query(
        "UPDATE flow_step_instances SET input = ?2, updated_at = CURRENT_TIMESTAMP WHERE id = ?1",
    )
    .bind(step_id)
    .bind(&input_json)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn complete_step(
    pool: &SqlitePool,
    step_id: Uuid,
    from: StepStatus,
    output: &serde_json::Value,
) -> Result<bool, PersistenceError> {
    let output_json = serde_json::to_string(output)
        .map_err(|e| PersistenceError::Corrupt(format!("step output: {e}")))?;

    let result = sqlx::query(
        r#"
        UPDATE flow_step_instances
        SET status = 'SUCCEEDED', output = ?3, updated_at = CURRENT_TIMESTAMP
        WHERE id = ?1 AND status = ?2
        "#,
    )
    .bind(step_id)
    .bind(from.as_str())
    .bind(&output_json)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn wait_step(
    pool: &SqlitePool,
    step_id: Uuid,
    from: StepStatus,
    correlation: Option<&BTreeMap<String, String>>,
) -> Result<bool, PersistenceError> {
    let correlation_json = correlation
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| PersistenceError::Corrupt(format!("step correlation: {e}")))?;

    let result = sqlx::query(
        r#"
        UPDATE flow_step_instances
        SET status = 'WAITING',
            correlation = COALESCE(?3, correlation),
            updated_at = CURRENT_TIMESTAMP
        WHERE id = ?1 AND status = ?2
        "#,
    )
    .bind(step_id)
    .bind(from.as_str())
    .bind(&correlation_json)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn fail_step(
    pool: &SqlitePool,
    step_id: Uuid,
    from: StepStatus,
    error: &str,
) -> Result<bool, PersistenceError> {
    let result = sqlx::query(
        r#"
        UPDATE flow_step_instances
        SET status = 'FAILED', error = ?3, updated_at = CURRENT_TIMESTAMP
        WHERE id = ?1 AND status = ?2
        "#,
    )
    .bind(step_id)
    .bind(from.as_str())
    .bind(error)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Outputs of all succeeded steps, keyed by order; the runtime context a
/// step executes against is rebuilt from this every time.
pub async fn succeeded_outputs(
    pool: &SqlitePool,
    instance_id: Uuid,
) -> Result<BTreeMap<i64, serde_json::Value>, PersistenceError> {
    let rows = sqlx::query(
        r#"
        SELECT step_order, output
        FROM flow_step_instances
        WHERE flow_instance_id = ?1 AND status = 'SUCCEEDED'
        "#,
    )
    .bind(instance_id)
    .fetch_all(pool)
    .await?;

    let mut outputs = BTreeMap::new();
    for row in rows {
        let order: i64 = row.try_get("step_order")?;
        let output: Option<String> = row.try_get("output")?;
        let value = output
            .map(|raw| parse_json(&raw, "step output"))
            .transpose()?
            .unwrap_or(serde_json::Value::Null);
        outputs.insert(order, value);
    }

    Ok(outputs)
}

/// Signals are stored unconditionally, consumed or not.
pub async fn insert_signal(
    pool: &SqlitePool,
    signal: &InboundSignal,
) -> Result<Uuid, PersistenceError> {
    let signal_id = Uuid::new_v4();
    let correlation_json = serde_json::to_string(&signal.correlation)
        .map_err(|e| PersistenceError::Corrupt(format!("signal correlation: {e}")))?;
    let payload_json = serde_json::to_string(&signal.payload)
        .map_err(|e| PersistenceError::Corrupt(format!("signal payload: {e}")))?;

    sqlx::query(
        r#"
        INSERT INTO flow_signals (id, event_type, correlation, payload)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(signal_id)
    .bind(&signal.event_type)
    .bind(&correlation_json)
    .bind(&payload_json)
    .execute(pool)
    .await?;

    Ok(signal_id)
}

/// Links a stored signal to the one step it resumed. Conditional on the
/// signal not having been consumed before.
pub async fn consume_signal(
    pool: &SqlitePool,
    signal_id: Uuid,
    instance_id: Uuid,
    step_id: Uuid,
) -> Result<bool, PersistenceError> {
    let result = sqlx::query(
        r#"
        UPDATE flow_signals
        SET consumed_at = CURRENT_TIMESTAMP, flow_instance_id = ?2, step_instance_id = ?3
        WHERE id = ?1 AND consumed_at IS NULL
        "#,
    )
    .bind(signal_id)
    .bind(instance_id)
    .bind(step_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Count of stored-but-unconsumed signals, for tests and ops visibility.
pub async fn unconsumed_signal_count(pool: &SqlitePool) -> Result<i64, PersistenceError> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM flow_signals WHERE consumed_at IS NULL")
            .fetch_one(pool)
            .await?;

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Blockchain, CryptoCurrency, FiatCurrency};
    use crate::test_utils::{simple_definition, setup_test_db};

    fn corridor() -> Corridor {
        Corridor {
            blockchain: Blockchain::Stellar,
            crypto_currency: CryptoCurrency::Usdc,
            target_currency: FiatCurrency::Bob,
        }
    }

    #[tokio::test]
    async fn definition_round_trips_with_steps() {
        let pool = setup_test_db().await;
        let definition = simple_definition(corridor());
        insert_definition(&pool, &definition).await.unwrap();

        let loaded = find_enabled_definition(&pool, &corridor())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, definition);
    }

    #[tokio::test]
    async fn disabled_definitions_are_not_resolved() {
        let pool = setup_test_db().await;
        let mut definition = simple_definition(corridor());
        definition.enabled = false;
        insert_definition(&pool, &definition).await.unwrap();

        assert!(
            find_enabled_definition(&pool, &corridor())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn seed_skips_corridors_that_already_have_a_definition() {
        let pool = setup_test_db().await;
        let definition = simple_definition(corridor());

        assert_eq!(
            seed_definitions(&pool, std::slice::from_ref(&definition))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            seed_definitions(&pool, std::slice::from_ref(&definition))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn claim_step_is_won_exactly_once() {
        let pool = setup_test_db().await;
        let definition = simple_definition(corridor());
        insert_definition(&pool, &definition).await.unwrap();

        let (instance, steps) =
            crate::test_utils::instance_from_definition(&definition, Uuid::new_v4());
        create_instance(&pool, &instance, &steps).await.unwrap();

        assert!(claim_step(&pool, steps[0].id).await.unwrap());
        assert!(!claim_step(&pool, steps[0].id).await.unwrap());

        let step = find_step(&pool, instance.id, steps[0].step_order)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(step.status, StepStatus::Running);
        assert_eq!(step.attempts, 1);
    }

    #[tokio::test]
    async fn duplicate_instance_for_transaction_is_rejected() {
        let pool = setup_test_db().await;
        let definition = simple_definition(corridor());
        let transaction_id = Uuid::new_v4();

        let (first, first_steps) =
            crate::test_utils::instance_from_definition(&definition, transaction_id);
        create_instance(&pool, &first, &first_steps).await.unwrap();

        let (second, second_steps) =
            crate::test_utils::instance_from_definition(&definition, transaction_id);
        let err = create_instance(&pool, &second, &second_steps)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PersistenceError::Database(sqlx::Error::Database(ref db)) if db.is_unique_violation()
        ));
    }

    #[tokio::test]
    async fn signal_is_consumed_at_most_once() {
        let pool = setup_test_db().await;
        let signal = InboundSignal {
            event_type: "exchange_balance".to_string(),
            correlation: BTreeMap::new(),
            payload: serde_json::Value::Null,
        };

        let signal_id = insert_signal(&pool, &signal).await.unwrap();
        let instance_id = Uuid::new_v4();
        let step_id = Uuid::new_v4();

        assert!(
            consume_signal(&pool, signal_id, instance_id, step_id)
                .await
                .unwrap()
        );
        assert!(
            !consume_signal(&pool, signal_id, instance_id, step_id)
                .await
                .unwrap()
        );
        assert_eq!(unconsumed_signal_count(&pool).await.unwrap(), 0);
    }
}
