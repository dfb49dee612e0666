//! PostgreSQL driver integration tests
//!
//! Run with: cargo test -p recordb-pq --test pq_integration -- --ignored --test-threads=1

mod harness;

use std::time::Duration;

use harness::*;
use recordb_core::device::DEVICE_TYPE_IOS;
use recordb_pq::prelude::*;
use serial_test::serial;
use tokio::sync::mpsc;

// ============================================================================
// Records
// ============================================================================

mod record_tests {
    use super::*;

    #[tokio::test]
    #[ignore = "Requires Docker; run with --ignored"]
    #[serial]
    async fn test_save_and_get_round_trip() -> anyhow::Result<()> {
        let app = TestApp::new().await?;
        let db = app.conn.public_db();
        assert!(db.extend("note", &note_schema()).await?);

        let mut record = note("n1", "hello", 1.0);
        db.save(&mut record).await?;
        assert_eq!(record.database_id, "");

        let loaded = db.get(&RecordId::new("note", "n1")).await?;
        assert_eq!(loaded.owner_id, "alice");
        assert_eq!(loaded.get("title")?, Value::from("hello"));
        assert_eq!(loaded.get("order")?, Value::from(1.0));
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires Docker; run with --ignored"]
    #[serial]
    async fn test_numeric_column_reads_as_unknown() -> anyhow::Result<()> {
        let app = TestApp::new().await?;
        let db = app.conn.public_db();
        db.extend("note", &note_schema()).await?;

        let client = app.raw_client().await?;
        client
            .batch_execute(&format!(
                "ALTER TABLE \"{}\".\"note\" ADD COLUMN \"price\" numeric(10,2) DEFAULT 9.99",
                schema_name(&app.app_name)
            ))
            .await?;

        let schema = db.get_schema("note").await?;
        assert_eq!(schema.get("price").map(|f| f.data_type), Some(DataType::Unknown));

        db.save(&mut note("n1", "priced", 1.0)).await?;
        let loaded = db.get(&RecordId::new("note", "n1")).await?;
        assert!(matches!(loaded.get("price")?, Value::Unknown(_)));
        assert_eq!(loaded.get("title")?, Value::from("priced"));

        let mut updated = loaded.clone();
        updated.set("title", Value::from("repriced"))?;
        db.save(&mut updated).await?;
        let row = client
            .query_one(
                &format!(
                    "SELECT price::text FROM \"{}\".\"note\" WHERE _id = 'n1'",
                    schema_name(&app.app_name)
                ),
                &[],
            )
            .await?;
        assert_eq!(row.get::<_, String>(0), "9.99");
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires Docker; run with --ignored"]
    #[serial]
    async fn test_upsert_is_idempotent() -> anyhow::Result<()> {
        let app = TestApp::new().await?;
        let db = app.conn.public_db();
        db.extend("note", &note_schema()).await?;

        let mut record = note("n1", "first", 1.0);
        db.save(&mut record).await?;
        let mut record = note("n1", "second", 1.0);
        db.save(&mut record).await?;

        let count = db.query_count(&Query::new("note")).await?;
        assert_eq!(count, 1);
        let loaded = db.get(&RecordId::new("note", "n1")).await?;
        assert_eq!(loaded.get("title")?, Value::from("second"));
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires Docker; run with --ignored"]
    #[serial]
    async fn test_save_in_other_database_is_duplicated() -> anyhow::Result<()> {
        let app = TestApp::new().await?;
        app.conn.public_db().extend("note", &note_schema()).await?;

        let mut record = note("n1", "public", 1.0);
        app.conn.public_db().save(&mut record).await?;

        let mut private = note("n1", "private", 1.0);
        let err = app.conn.private_db("alice").save(&mut private).await.unwrap_err();
        assert!(matches!(err, Error::Duplicated { .. }));
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires Docker; run with --ignored"]
    #[serial]
    async fn test_union_database_is_read_only() -> anyhow::Result<()> {
        let app = TestApp::new().await?;
        let union = app.conn.union_db();
        assert!(union.is_read_only());

        let mut record = note("n1", "hello", 1.0);
        let err = union.save(&mut record).await.unwrap_err();
        assert!(matches!(err, Error::DatabaseIsReadOnly));
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires Docker; run with --ignored"]
    #[serial]
    async fn test_delete_missing_record() -> anyhow::Result<()> {
        let app = TestApp::new().await?;
        let db = app.conn.public_db();
        db.extend("note", &note_schema()).await?;

        let err = db.delete(&RecordId::new("note", "missing")).await.unwrap_err();
        assert!(err.is_not_found_of(Resource::Record));
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires Docker; run with --ignored"]
    #[serial]
    async fn test_sequence_values_increase() -> anyhow::Result<()> {
        let app = TestApp::new().await?;
        let db = app.conn.public_db();
        let schema = RecordSchema::new().with_field("number", FieldType::new(DataType::Sequence));
        db.extend("ticket", &schema).await?;

        let mut numbers = Vec::new();
        for key in ["t1", "t2", "t3"] {
            let mut record = Record::new(RecordId::new("ticket", key)).with_owner("alice");
            db.save(&mut record).await?;
            numbers.push(record.get("number")?.as_f64().unwrap_or_default());
        }
        assert!(numbers.windows(2).all(|w| w[0] < w[1]), "{:?}", numbers);
        Ok(())
    }
}

// ============================================================================
// Queries
// ============================================================================

mod query_tests {
    use super::*;

    #[tokio::test]
    #[ignore = "Requires Docker; run with --ignored"]
    #[serial]
    async fn test_query_sorted_and_filtered() -> anyhow::Result<()> {
        let app = TestApp::new().await?;
        let db = app.conn.public_db();
        db.extend("note", &note_schema()).await?;
        for (key, order) in [("a", 3.0), ("b", 1.0), ("c", 2.0)] {
            db.save(&mut note(key, key, order)).await?;
        }

        let query = Query::new("note")
            .with_predicate(Predicate::compare(
                Operator::GreaterThan,
                Expression::key_path("order"),
                Expression::literal(1.0),
            ))
            .with_sort(Sort::asc("order"));
        let mut cursor = db.query(&query).await?;
        let keys: Vec<String> = cursor
            .collect_all()
            .await?
            .into_iter()
            .map(|r| r.id.key)
            .collect();
        assert_eq!(keys, vec!["c", "a"]);
        assert_eq!(db.query_count(&query).await?, 2);
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires Docker; run with --ignored"]
    #[serial]
    async fn test_query_descending_with_paging() -> anyhow::Result<()> {
        let app = TestApp::new().await?;
        let db = app.conn.public_db();
        let schema = RecordSchema::new()
            .with_field("content", FieldType::new(DataType::String))
            .with_field("order", FieldType::new(DataType::Number));
        db.extend("note", &schema).await?;
        for order in [1.0, 2.0, 3.0] {
            let mut record = Record::new(RecordId::new("note", format!("n{}", order)))
                .with_owner("alice")
                .with_field("content", "text")
                .with_field("order", order);
            db.save(&mut record).await?;
        }

        let query = Query::new("note")
            .with_sort(Sort::desc("order"))
            .with_limit(2)
            .with_offset(1);
        let orders: Vec<f64> = db
            .query(&query)
            .await?
            .collect_all()
            .await?
            .iter()
            .filter_map(|r| r.get("order").ok().and_then(|v| v.as_f64()))
            .collect();
        assert_eq!(orders, vec![2.0, 1.0]);
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires Docker; run with --ignored"]
    #[serial]
    async fn test_query_unknown_type_is_empty() -> anyhow::Result<()> {
        let app = TestApp::new().await?;
        let mut cursor = app.conn.public_db().query(&Query::new("nothing")).await?;
        assert!(cursor.next().await?.is_none());
        Ok(())
    }
}

// ============================================================================
// Transactions
// ============================================================================

mod tx_tests {
    use super::*;

    #[tokio::test]
    #[ignore = "Requires Docker; run with --ignored"]
    #[serial]
    async fn test_transaction_state_errors() -> anyhow::Result<()> {
        let app = TestApp::new().await?;
        assert!(matches!(app.conn.commit().await, Err(Error::TxDidNotBegin)));

        app.conn.begin().await?;
        assert!(matches!(app.conn.begin().await, Err(Error::TxDidBegin)));
        app.conn.rollback().await?;
        assert!(!app.conn.in_transaction());
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires Docker; run with --ignored"]
    #[serial]
    async fn test_rollback_discards_save() -> anyhow::Result<()> {
        let app = TestApp::new().await?;
        let db = app.conn.public_db();
        db.extend("note", &note_schema()).await?;

        app.conn.begin().await?;
        db.save(&mut note("n1", "hello", 1.0)).await?;
        app.conn.rollback().await?;

        let err = db.get(&RecordId::new("note", "n1")).await.unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }
}

// ============================================================================
// Users, roles and relations
// ============================================================================

mod user_tests {
    use super::*;

    #[tokio::test]
    #[ignore = "Requires Docker; run with --ignored"]
    #[serial]
    async fn test_user_roles() -> anyhow::Result<()> {
        let app = TestApp::new().await?;
        let mut user = User::new("u1");
        user.username = Some("alice".to_string());
        user.roles = vec!["writer".to_string()];
        app.conn.create_user(&user).await?;

        let err = app.conn.create_user(&user).await.unwrap_err();
        assert!(matches!(err, Error::Duplicated { .. }));

        let loaded = app.conn.get_user_by_username("alice").await?;
        assert_eq!(loaded.roles, vec!["writer".to_string()]);

        let ids = vec!["u1".to_string()];
        app.conn.assign_roles(&ids, &["admin".to_string()]).await?;
        app.conn.set_admin_roles(&["admin".to_string()]).await?;
        assert_eq!(app.conn.get_admin_roles().await?, vec!["admin".to_string()]);

        let mut roles = app.conn.get_roles(&ids).await?.remove("u1").unwrap_or_default();
        roles.sort();
        assert_eq!(roles, vec!["admin".to_string(), "writer".to_string()]);
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires Docker; run with --ignored"]
    #[serial]
    async fn test_relations() -> anyhow::Result<()> {
        let app = TestApp::new().await?;
        for id in ["u1", "u2", "u3"] {
            app.conn.create_user(&User::new(id)).await?;
        }
        app.conn.add_relation("u1", RelationKind::Follow, "u2").await?;
        app.conn.add_relation("u2", RelationKind::Follow, "u1").await?;
        app.conn.add_relation("u1", RelationKind::Follow, "u3").await?;

        let outward = app
            .conn
            .query_relation("u1", RelationKind::Follow, RelationDirection::Outward, QueryConfig::default())
            .await?;
        assert_eq!(outward.len(), 2);
        let mutual = app
            .conn
            .query_relation_count("u1", RelationKind::Follow, RelationDirection::Mutual)
            .await?;
        assert_eq!(mutual, 1);

        let err = app
            .conn
            .remove_relation("u3", RelationKind::Follow, "u1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        Ok(())
    }
}

// ============================================================================
// Devices, subscriptions and change notifications
// ============================================================================

mod notification_tests {
    use super::*;

    #[tokio::test]
    #[ignore = "Requires Docker; run with --ignored"]
    #[serial]
    async fn test_device_and_subscription() -> anyhow::Result<()> {
        let app = TestApp::new().await?;
        app.conn.create_user(&User::new("alice")).await?;
        app.conn
            .save_device(&Device::new("d1", DEVICE_TYPE_IOS, "token-1", "alice"))
            .await?;

        let db = app.conn.public_db();
        let query = Query::new("note").with_predicate(Predicate::equal(
            Expression::key_path("category"),
            Expression::literal("work"),
        ));
        db.save_subscription(&Subscription::new("s1", "d1", query)).await?;

        let err = db
            .save_subscription(&Subscription::new("s2", "missing", Query::new("note")))
            .await
            .unwrap_err();
        assert!(err.is_not_found_of(Resource::Device));

        let matched = db.get_matching_subscriptions(&note("n1", "hello", 1.0)).await?;
        assert_eq!(matched.len(), 1);
        let private = app.conn.private_db("alice");
        assert!(private
            .get_matching_subscriptions(&note("n1", "x", 1.0))
            .await?
            .is_empty());

        app.conn.delete_device("d1").await?;
        assert!(db.get_subscriptions_by_device_id("d1").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires Docker; run with --ignored"]
    #[serial]
    async fn test_record_changes_are_delivered() -> anyhow::Result<()> {
        let app = TestApp::new().await?;
        let db = app.conn.public_db();
        db.extend("note", &note_schema()).await?;

        let (tx, mut rx) = mpsc::channel(16);
        app.conn.subscribe(tx).await?;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let writer = app.reconnect().await?;
        writer.public_db().save(&mut note("n1", "hello", 1.0)).await?;

        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("listener closed"))?;
        assert_eq!(event.event, RecordHookEvent::Created);
        assert_eq!(event.record.id, RecordId::new("note", "n1"));

        app.driver.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires Docker; run with --ignored"]
    #[serial]
    async fn test_undecodable_change_stays_pending() -> anyhow::Result<()> {
        let app = TestApp::new().await?;
        let db = app.conn.public_db();
        db.extend("note", &note_schema()).await?;

        let (tx, mut rx) = mpsc::channel(16);
        app.conn.subscribe(tx).await?;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let schema = schema_name(&app.app_name);
        let client = app.raw_client().await?;
        let row = client
            .query_one(
                "INSERT INTO public.pending_notification (op, appname, recordtype, record) \
                 VALUES ('TRUNCATE', $1, 'note', '{\"_id\": \"n1\", \"_owner_id\": \"alice\"}'::jsonb) \
                 RETURNING id",
                &[&schema],
            )
            .await?;
        let id: i32 = row.get(0);
        client
            .batch_execute(&format!("NOTIFY record_change, '{}'", id))
            .await?;

        // a decodable change queued behind it proves the listener moved on
        let writer = app.reconnect().await?;
        writer.public_db().save(&mut note("n2", "after", 2.0)).await?;
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("listener closed"))?;
        assert_eq!(event.record.id, RecordId::new("note", "n2"));

        let staged = client
            .query_opt("SELECT op FROM public.pending_notification WHERE id = $1", &[&id])
            .await?;
        assert_eq!(staged.map(|r| r.get::<_, String>(0)).as_deref(), Some("TRUNCATE"));

        client
            .execute("DELETE FROM public.pending_notification WHERE id = $1", &[&id])
            .await?;
        app.driver.shutdown().await;
        Ok(())
    }
}
