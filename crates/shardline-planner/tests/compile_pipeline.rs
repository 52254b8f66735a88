//! End-to-end compilation over a small sharded topology

use shardline_ast::{Delete, Expr, FromItem, JoinKind, Select, SelectItem, Statement, TableName, Update, Assignment};
use shardline_ir::{ColumnInfo, DataNode, DataType, Distribution, LogicalTable, MockCatalog, RelNode, TableType, Value};
use shardline_planner::{CompiledPlan, OptimizerOptions, Phase, PlanError, SqlCompiler};
use shardline_registry::{HashModSharding, RangeSharding, RangeSpec, ShardingRuleSpec};
use shardline_route::{ReadReplica, RouteError};
use std::sync::Arc;

fn range_table(name: &str, columns: &[&str]) -> LogicalTable {
    let spec = ShardingRuleSpec {
        function: "range".into(),
        columns: vec!["customer_id".into()],
        nodes: vec![DataNode::new("N1", "db_0", name), DataNode::new("N2", "db_1", name)],
        ranges: vec![RangeSpec { start: 0, end: 99, node: 0 }, RangeSpec { start: 100, end: 199, node: 1 }],
    };
    let columns = columns.iter().map(|c| ColumnInfo::new(*c, DataType::Int64)).collect();
    LogicalTable::new("shop", name, columns)
        .with_primary_key(&["id"])
        .with_distribution(Distribution::Sharding(Arc::new(RangeSharding::from_spec(&spec).unwrap())))
}

fn catalog() -> MockCatalog {
    let mut catalog = MockCatalog::new();
    catalog.add_table(range_table("orders", &["id", "customer_id", "status"]));
    catalog.add_table(range_table("order_items", &["id", "customer_id", "sku"]));
    catalog.add_table(
        LogicalTable::new(
            "shop",
            "customers",
            vec![ColumnInfo::new("id", DataType::Int64), ColumnInfo::new("name", DataType::Text)],
        )
        .with_primary_key(&["id"])
        .with_distribution(Distribution::Sharding(Arc::new(HashModSharding::new(
            vec!["id".into()],
            (0..4).map(|i| DataNode::new(format!("H{}", i), format!("db_{}", i), "customers")).collect(),
        )
        .unwrap()))),
    );
    catalog.add_table(
        LogicalTable::new(
            "shop",
            "regions",
            vec![ColumnInfo::new("id", DataType::Int64), ColumnInfo::new("label", DataType::Text)],
        )
        .with_distribution(Distribution::Global(vec![
            DataNode::new("N1", "db_0", "regions"),
            DataNode::new("N2", "db_1", "regions"),
            DataNode::new("N3", "db_2", "regions"),
        ])),
    );
    catalog.add_table(
        LogicalTable::new("shop", "audit", vec![ColumnInfo::new("id", DataType::Int64)])
            .with_distribution(Distribution::Custom),
    );
    catalog
}

fn orders_select(selection: Option<Expr>) -> Statement {
    Statement::Select(Select {
        projection: vec![SelectItem::expr(Expr::ident("o.id"))],
        from: vec![FromItem::table(TableName::new("orders"), Some("o"))],
        selection,
        ..Default::default()
    })
}

fn query(compiler: &SqlCompiler<'_>, statement: &Statement, params: &[Value]) -> shardline_planner::Optimized {
    match compiler.compile(statement, params).unwrap() {
        CompiledPlan::Query(optimized) => optimized,
        CompiledPlan::Mutation(_) => panic!("expected a query plan"),
    }
}

fn routed_targets(node: &RelNode) -> Vec<String> {
    match node {
        RelNode::RoutedScan { target, .. } => vec![target.clone()],
        RelNode::Gather { inputs } => inputs.iter().flat_map(|i| routed_targets(i)).collect(),
        _ => vec![],
    }
}

#[test]
fn test_point_query_routes_to_one_node() {
    let catalog = catalog();
    let compiler = SqlCompiler::new(&catalog, "shop");
    let statement = orders_select(Some(Expr::ident("o.customer_id").equals(Expr::placeholder(0))));

    let optimized = query(&compiler, &statement, &[Value::Int(150)]);

    let RelNode::RoutedScan { target, sql, params, .. } = optimized.plan.as_ref() else {
        panic!("expected a single routed scan, got {}", optimized.plan.name());
    };
    assert_eq!(target, "N2");
    assert!(sql.contains("FROM db_1.orders AS o"), "{}", sql);
    assert_eq!(params, &vec![Value::Int(150)]);
    assert!(optimized.trace.fired("RouteView"));
}

#[test]
fn test_unknown_condition_broadcasts() {
    let catalog = catalog();
    let compiler = SqlCompiler::new(&catalog, "shop");
    let statement = orders_select(Some(Expr::ident("o.status").equals(Expr::lit(3))));

    let optimized = query(&compiler, &statement, &[]);

    assert_eq!(optimized.plan.name(), "Gather");
    assert_eq!(routed_targets(&optimized.plan), vec!["N1", "N2"]);
}

#[test]
fn test_optimized_plan_is_reusable_across_parameters() {
    let catalog = catalog();
    let compiler = SqlCompiler::new(&catalog, "shop");
    let statement = orders_select(Some(Expr::ident("o.customer_id").equals(Expr::placeholder(0))));

    let optimized = compiler.optimize(&statement).unwrap();
    assert_eq!(optimized.plan.name(), "View");

    let low = compiler.route(&optimized, &[Value::Int(5)]).unwrap();
    let high = compiler.route(&optimized, &[Value::Int(105)]).unwrap();
    assert_eq!(routed_targets(&low.plan), vec!["N1"]);
    assert_eq!(routed_targets(&high.plan), vec!["N2"]);
}

#[test]
fn test_colocated_join_pushed_into_one_statement() {
    let catalog = catalog();
    let compiler = SqlCompiler::new(&catalog, "shop");
    let from = FromItem::table(TableName::new("orders"), Some("o")).join(
        FromItem::table(TableName::new("order_items"), Some("i")),
        JoinKind::Inner,
        Expr::ident("o.customer_id").equals(Expr::ident("i.customer_id")),
    );
    let statement = Statement::Select(Select {
        projection: vec![SelectItem::expr(Expr::ident("o.id")), SelectItem::expr(Expr::ident("i.sku"))],
        from: vec![from],
        selection: Some(Expr::ident("o.customer_id").equals(Expr::placeholder(0))),
        ..Default::default()
    });

    let optimized = query(&compiler, &statement, &[Value::Int(20)]);

    let RelNode::RoutedScan { target, sql, .. } = optimized.plan.as_ref() else {
        panic!("expected a single routed scan, got {}", optimized.plan.name());
    };
    assert_eq!(target, "N1");
    assert!(sql.contains("db_0.orders AS o"), "{}", sql);
    assert!(sql.contains("JOIN db_0.order_items AS i"), "{}", sql);
    assert!(optimized.trace.fired("JoinIntoView"));
}

#[test]
fn test_join_across_placements_stays_above_views() {
    let catalog = catalog();
    let compiler = SqlCompiler::new(&catalog, "shop");
    let from = FromItem::table(TableName::new("orders"), Some("o")).join(
        FromItem::table(TableName::new("customers"), Some("c")),
        JoinKind::Inner,
        Expr::ident("o.customer_id").equals(Expr::ident("c.id")),
    );
    let statement = Statement::Select(Select {
        projection: vec![SelectItem::expr(Expr::ident("o.id")), SelectItem::expr(Expr::ident("c.name"))],
        from: vec![from],
        ..Default::default()
    });

    let optimized = query(&compiler, &statement, &[]);

    assert!(optimized.trace.fired("JoinNotColocated"));
    assert!(optimized.plan.any(&|n| matches!(n, RelNode::Join { .. })));
    assert!(optimized.plan.any(&|n| matches!(n, RelNode::RoutedScan { target, .. } if target == "H3")));
}

#[test]
fn test_exists_subquery_becomes_semi_join() {
    let catalog = catalog();
    let compiler = SqlCompiler::new(&catalog, "shop");
    let subquery = Select {
        projection: vec![SelectItem::expr(Expr::ident("i.id"))],
        from: vec![FromItem::table(TableName::new("order_items"), Some("i"))],
        selection: Some(Expr::ident("i.customer_id").equals(Expr::ident("o.customer_id"))),
        ..Default::default()
    };
    let statement = orders_select(Some(Expr::Exists {
        subquery: Box::new(subquery),
        negated: false,
    }));

    let optimized = query(&compiler, &statement, &[]);

    assert_eq!(optimized.trace.rules(Phase::Decorrelate), vec!["SubQueryToCorrelate"]);
    let RelNode::Gather { inputs } = optimized.plan.as_ref() else {
        panic!("expected a gather, got {}", optimized.plan.name());
    };
    for input in inputs {
        let RelNode::RoutedScan { sql, .. } = input.as_ref() else {
            panic!("expected routed scans");
        };
        assert!(sql.contains("EXISTS"), "{}", sql);
    }
}

#[test]
fn test_global_read_picks_configured_replica() {
    let catalog = catalog();
    let options = OptimizerOptions {
        global_read: ReadReplica::Last,
        ..Default::default()
    };
    let compiler = SqlCompiler::new(&catalog, "shop").with_options(options);
    let statement = Statement::Select(Select::from_table(TableName::new("regions")));

    let optimized = query(&compiler, &statement, &[]);

    assert_eq!(routed_targets(&optimized.plan), vec!["N3"]);
}

#[test]
fn test_delete_by_sharding_key_hits_one_node() {
    let catalog = catalog();
    let compiler = SqlCompiler::new(&catalog, "shop");
    let statement = Statement::Delete(Delete {
        table: TableName::new("orders"),
        selection: Some(Expr::ident("customer_id").equals(Expr::lit(150))),
    });

    let plan = compiler.compile_mutation(&statement, &[]).unwrap();

    assert_eq!(plan.table_type, TableType::Sharding);
    assert_eq!(plan.statements.targets(), vec!["N2"]);
    assert!(plan.statements.is_proxy());
}

#[test]
fn test_global_update_fans_out_to_every_replica() {
    let catalog = catalog();
    let compiler = SqlCompiler::new(&catalog, "shop");
    let statement = Statement::Update(Update {
        table: TableName::new("regions"),
        assignments: vec![Assignment {
            column: "label".into(),
            value: Expr::placeholder(0),
        }],
        selection: Some(Expr::ident("id").equals(Expr::placeholder(1))),
    });

    let plan = compiler
        .compile_mutation(&statement, &[Value::from("north"), Value::Int(1)])
        .unwrap();

    assert_eq!(plan.statements.len(), 3);
    assert_eq!(plan.statements.targets(), vec!["N1", "N2", "N3"]);
}

#[test]
fn test_sharding_key_update_rejected() {
    let catalog = catalog();
    let compiler = SqlCompiler::new(&catalog, "shop");
    let statement = Statement::Update(Update {
        table: TableName::new("orders"),
        assignments: vec![Assignment {
            column: "customer_id".into(),
            value: Expr::lit(7),
        }],
        selection: Some(Expr::ident("id").equals(Expr::lit(1))),
    });

    let err = compiler.compile_mutation(&statement, &[]).unwrap_err();
    assert!(matches!(err, PlanError::Route(RouteError::ShardingKeyUpdate { ref column, .. }) if column == "customer_id"));
}

#[test]
fn test_custom_table_mutation_rejected() {
    let catalog = catalog();
    let compiler = SqlCompiler::new(&catalog, "shop");
    let statement = Statement::Delete(Delete {
        table: TableName::new("audit"),
        selection: None,
    });

    let err = compiler.compile_mutation(&statement, &[]).unwrap_err();
    assert!(matches!(err, PlanError::UnsupportedTableType { table_type: TableType::Custom, .. }));
}

fn routed_sqls(node: &RelNode) -> Vec<String> {
    match node {
        RelNode::RoutedScan { sql, .. } => vec![sql.clone()],
        other => other.inputs().iter().flat_map(|i| routed_sqls(i)).collect(),
    }
}

fn count_where(table: &str, alias: &str, key: &str) -> Statement {
    Statement::Select(Select {
        projection: vec![SelectItem::expr(Expr::call("count", vec![Expr::ident(&format!("{}.id", alias))]))],
        from: vec![FromItem::table(TableName::new(table), Some(alias))],
        selection: Some(Expr::ident(&format!("{}.{}", alias, key)).equals(Expr::placeholder(0))),
        ..Default::default()
    })
}

#[test]
fn test_aggregate_stays_above_range_view_with_bound_key() {
    let catalog = catalog();
    let compiler = SqlCompiler::new(&catalog, "shop");
    let statement = count_where("orders", "o", "customer_id");

    // 500 is outside every range and reaches both nodes
    let optimized = query(&compiler, &statement, &[Value::Int(500)]);

    assert!(optimized.plan.any(&|n| matches!(n, RelNode::Aggregate { .. })));
    assert_eq!(routed_targets_deep(&optimized.plan), vec!["N1", "N2"]);
    for sql in routed_sqls(&optimized.plan) {
        assert!(!sql.contains("COUNT("), "{}", sql);
    }
}

#[test]
fn test_aggregate_pushed_into_hash_view_with_bound_key() {
    let catalog = catalog();
    let compiler = SqlCompiler::new(&catalog, "shop");
    let statement = count_where("customers", "c", "id");

    let optimized = query(&compiler, &statement, &[Value::Int(6)]);

    let RelNode::RoutedScan { target, sql, .. } = optimized.plan.as_ref() else {
        panic!("expected one routed scan, got {}", optimized.plan.name());
    };
    assert_eq!(target, "H2");
    assert!(sql.contains("COUNT("), "{}", sql);
}

fn routed_targets_deep(node: &RelNode) -> Vec<String> {
    match node {
        RelNode::RoutedScan { target, .. } => vec![target.clone()],
        other => other.inputs().iter().flat_map(|i| routed_targets_deep(i)).collect(),
    }
}

#[test]
fn test_global_index_choice_is_advisory() {
    let mut catalog = MockCatalog::new();
    catalog.add_table(range_table("orders", &["id", "customer_id", "status"]).with_index("idx_status", &["status"]));
    let compiler = SqlCompiler::new(&catalog, "shop").with_gsi(true);
    let statement = orders_select(Some(Expr::ident("o.status").equals(Expr::placeholder(0))));

    let optimized = compiler.optimize(&statement).unwrap();
    assert!(optimized.plan.any(&|n| matches!(
        n,
        RelNode::View { index_probe: Some(probe), .. } if probe.index == "idx_status"
    )));
    assert!(shardline_planner::explain(&optimized.plan).contains("index=idx_status"));

    // Routing still reads every shard
    let routed = query(&compiler, &statement, &[Value::Int(3)]);
    assert_eq!(routed_targets_deep(&routed.plan), vec!["N1", "N2"]);
}
