//! Engine scenarios over a config-file topology and a recording session

use shardline_ast::{Expr, FromItem, Insert, Select, SelectItem, Statement, TableName, Update, Assignment};
use shardline_engine::{Engine, EngineError, StatementResult};
use shardline_exec::{BackendError, ExecError, Outcome, PhysicalConnection, Rows, TransactionSession};
use shardline_ir::Value;
use shardline_route::RouteError;
use shardline_planner::PlanError;
use std::cell::RefCell;
use std::io::Write;

const TOPOLOGY: &str = r#"
logging:
  level: debug
optimizer:
  match_limit: 128
plan_cache:
  enabled: true
topology:
  default_schema: shop
  tables:
    - name: orders
      type: sharding
      columns:
        - { name: id, type: bigint, nullable: false }
        - { name: customer_id, type: bigint }
        - { name: status, type: int }
      primary_key: [id]
      auto_increment: id
      sharding:
        function: range
        columns: [customer_id]
        nodes:
          - { target: N1, schema: db_0, table: orders }
          - { target: N2, schema: db_1, table: orders }
        ranges:
          - { start: 0, end: 99, node: 0 }
          - { start: 100, end: 199, node: 1 }
    - name: regions
      type: global
      columns:
        - { name: id, type: bigint }
        - { name: label, type: text }
      replicas:
        - { target: N1, schema: db_0, table: regions }
        - { target: N2, schema: db_1, table: regions }
"#;

#[derive(Default)]
struct RecordingSession {
    log: RefCell<Vec<(String, String, Vec<Value>)>>,
}

struct RecordingConnection<'s> {
    target: String,
    log: &'s RefCell<Vec<(String, String, Vec<Value>)>>,
}

impl PhysicalConnection for RecordingConnection<'_> {
    fn execute_update(&mut self, sql: &str, params: &[Value]) -> Result<Outcome, BackendError> {
        self.log
            .borrow_mut()
            .push((self.target.clone(), sql.to_string(), params.to_vec()));
        Ok(Outcome {
            affected: 1,
            last_insert_id: None,
        })
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Rows, BackendError> {
        self.log
            .borrow_mut()
            .push((self.target.clone(), sql.to_string(), params.to_vec()));
        Ok(Rows {
            columns: vec!["id".into()],
            rows: vec![vec![Value::String(self.target.clone())]],
        })
    }
}

impl TransactionSession for RecordingSession {
    fn transaction_id(&self) -> &str {
        "tx-engine"
    }

    fn get_connection(&self, target: &str) -> Result<Box<dyn PhysicalConnection + '_>, BackendError> {
        Ok(Box::new(RecordingConnection {
            target: target.to_string(),
            log: &self.log,
        }))
    }
}

fn engine() -> anyhow::Result<Engine> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(TOPOLOGY.as_bytes())?;
    Ok(Engine::from_file(file.path())?)
}

fn orders_by_customer(selection: Expr) -> Statement {
    Statement::Select(Select {
        projection: vec![SelectItem::expr(Expr::ident("o.id"))],
        from: vec![FromItem::table(TableName::new("orders"), Some("o"))],
        selection: Some(selection),
        ..Default::default()
    })
}

#[test]
fn test_config_file_loaded() -> anyhow::Result<()> {
    let engine = engine()?;
    assert_eq!(engine.config().optimizer.match_limit, 128);
    assert_eq!(engine.catalog().len(), 2);
    assert!(engine.plan_manager().is_some());
    Ok(())
}

#[test]
fn test_point_query_executes_on_one_node() -> anyhow::Result<()> {
    let engine = engine()?;
    let session = RecordingSession::default();
    let statement = orders_by_customer(Expr::ident("o.customer_id").equals(Expr::placeholder(0)));

    let StatementResult::Rows(rows) = engine.execute(&statement, &[Value::Int(120)], &session)? else {
        panic!("expected rows");
    };
    assert_eq!(rows.rows, vec![vec![Value::String("N2".into())]]);
    let log = session.log.borrow();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].0, "N2");
    assert_eq!(log[0].2, vec![Value::Int(120)]);
    Ok(())
}

#[test]
fn test_parameterized_plan_reused_from_baseline() -> anyhow::Result<()> {
    let engine = engine()?;
    let statement = orders_by_customer(Expr::ident("o.customer_id").equals(Expr::placeholder(0)));

    assert!(!engine.optimize(&statement)?.hit);
    assert!(engine.optimize(&statement)?.hit);

    // A cached plan still routes by the bound value
    let session = RecordingSession::default();
    engine.execute(&statement, &[Value::Int(7)], &session)?;
    assert_eq!(session.log.borrow()[0].0, "N1");

    let manager = engine.plan_manager().expect("plan cache enabled");
    let baseline = manager
        .persistor()
        .load_by_fingerprint(&statement.fingerprint())
        .expect("baseline stored");
    assert_eq!(baseline.plans.len(), 1);
    Ok(())
}

#[test]
fn test_literal_query_not_cached() -> anyhow::Result<()> {
    let engine = engine()?;
    let statement = orders_by_customer(Expr::ident("o.customer_id").equals(Expr::lit(7)));

    assert!(!engine.optimize(&statement)?.hit);
    assert!(!engine.optimize(&statement)?.hit);
    let manager = engine.plan_manager().expect("plan cache enabled");
    assert!(manager.persistor().load_by_fingerprint(&statement.fingerprint()).is_none());
    Ok(())
}

#[test]
fn test_literal_query_ignores_parameterized_baseline() -> anyhow::Result<()> {
    let engine = engine()?;
    let session = RecordingSession::default();
    let parameterized = orders_by_customer(Expr::ident("o.customer_id").equals(Expr::placeholder(0)));
    let literal = orders_by_customer(Expr::ident("o.customer_id").equals(Expr::lit(5)));
    assert_eq!(parameterized.fingerprint(), literal.fingerprint());

    engine.execute(&parameterized, &[Value::Int(150)], &session)?;
    let StatementResult::Rows(rows) = engine.execute(&literal, &[], &session)? else {
        panic!("expected rows");
    };

    assert_eq!(rows.rows, vec![vec![Value::String("N1".into())]]);
    let log = session.log.borrow();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].0, "N2");
    assert_eq!(log[1].0, "N1");
    assert!(log[1].2.is_empty());
    Ok(())
}

#[test]
fn test_insert_reports_generated_id() -> anyhow::Result<()> {
    let engine = engine()?;
    let session = RecordingSession::default();
    let statement = Statement::Insert(Insert {
        table: TableName::new("orders"),
        columns: vec!["customer_id".into(), "status".into()],
        rows: vec![vec![Expr::placeholder(0), Expr::placeholder(1)]],
    });

    let StatementResult::Update(report) = engine.execute(&statement, &[Value::Int(150), Value::Int(1)], &session)?
    else {
        panic!("expected an update result");
    };
    assert_eq!(report.result.affected_rows, 1);
    assert_eq!(report.result.last_insert_id, Some(1));
    assert_eq!(report.records.len(), 1);
    assert_eq!(report.records[0].target, "N2");
    assert!(session.log.borrow()[0].1.contains("db_1.orders"));
    Ok(())
}

#[test]
fn test_global_update_written_to_every_replica() -> anyhow::Result<()> {
    let engine = engine()?;
    let session = RecordingSession::default();
    let statement = Statement::Update(Update {
        table: TableName::new("regions"),
        assignments: vec![Assignment {
            column: "label".into(),
            value: Expr::placeholder(0),
        }],
        selection: Some(Expr::ident("id").equals(Expr::lit(1))),
    });

    let StatementResult::Update(report) = engine.execute(&statement, &[Value::String("EU".into())], &session)? else {
        panic!("expected an update result");
    };
    assert_eq!(report.result.affected_rows, 2);
    assert_eq!(report.result.last_insert_id, None);
    let targets: Vec<String> = session.log.borrow().iter().map(|(t, _, _)| t.clone()).collect();
    assert_eq!(targets, vec!["N1", "N2"]);

    let explained = engine.explain(&statement, &[Value::String("EU".into())])?;
    assert_eq!(explained.lines().count(), 2);
    assert!(explained.starts_with("target:N1 "), "{}", explained);
    Ok(())
}

#[test]
fn test_sharding_key_update_rejected() -> anyhow::Result<()> {
    let engine = engine()?;
    let statement = Statement::Update(Update {
        table: TableName::new("orders"),
        assignments: vec![Assignment {
            column: "customer_id".into(),
            value: Expr::lit(5),
        }],
        selection: Some(Expr::ident("id").equals(Expr::lit(1))),
    });

    let err = engine
        .execute(&statement, &[], &RecordingSession::default())
        .unwrap_err();
    assert!(
        matches!(err, EngineError::Plan(PlanError::Route(RouteError::ShardingKeyUpdate { .. }))),
        "{}",
        err
    );
    Ok(())
}

#[test]
fn test_unknown_target_surfaces_connection_error() -> anyhow::Result<()> {
    struct NoNodes;
    impl TransactionSession for NoNodes {
        fn transaction_id(&self) -> &str {
            "tx-none"
        }
        fn get_connection(&self, target: &str) -> Result<Box<dyn PhysicalConnection + '_>, BackendError> {
            Err(format!("no route to {}", target).into())
        }
    }

    let engine = engine()?;
    let statement = orders_by_customer(Expr::ident("o.customer_id").equals(Expr::placeholder(0)));
    let err = engine.execute(&statement, &[Value::Int(3)], &NoNodes).unwrap_err();
    assert!(matches!(err, EngineError::Exec(ExecError::Connection { ref target, .. }) if target == "N1"));
    Ok(())
}
