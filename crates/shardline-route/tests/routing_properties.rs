//! Routing properties over realistic topologies

use shardline_ast::{Delete, Expr as AstExpr, Statement, TableName, Update};
use shardline_ir::{
    BinOp, ColumnInfo, DataNode, DataType, Distribution, Expr, LogicalTable, ShardingValues, Value,
};
use shardline_registry::{HashModSharding, RangeSpec, RangeSharding, ShardingRuleSpec};
use shardline_route::{DistributionResolver, PredicateAnalyzer, ShardingInput, StatementRewriter};
use std::collections::BTreeSet;
use std::sync::Arc;

fn columns() -> Vec<ColumnInfo> {
    vec![
        ColumnInfo::new("id", DataType::Int64),
        ColumnInfo::new("customer_id", DataType::Int64),
        ColumnInfo::new("status", DataType::Text),
    ]
}

fn range_orders() -> LogicalTable {
    let spec = ShardingRuleSpec {
        function: "range".into(),
        columns: vec!["customer_id".into()],
        nodes: vec![DataNode::new("N1", "db_0", "orders"), DataNode::new("N2", "db_1", "orders")],
        ranges: vec![RangeSpec { start: 0, end: 99, node: 0 }, RangeSpec { start: 100, end: 199, node: 1 }],
    };
    LogicalTable::new("shop", "orders", columns())
        .with_primary_key(&["id"])
        .with_distribution(Distribution::Sharding(Arc::new(RangeSharding::from_spec(&spec).unwrap())))
}

fn hash_orders(n: usize) -> LogicalTable {
    let nodes = (0..n)
        .map(|i| DataNode::new(format!("n{}", i), format!("db_{}", i), "orders"))
        .collect();
    LogicalTable::new("shop", "orders", columns())
        .with_primary_key(&["id"])
        .with_distribution(Distribution::Sharding(Arc::new(HashModSharding::new(
            vec!["customer_id".into()],
            nodes,
        )
        .unwrap())))
}

fn cmp(op: BinOp, column: &str, v: i64) -> Expr {
    Expr::BinaryOp {
        op,
        left: Box::new(shardline_ir::col(column)),
        right: Box::new(shardline_ir::lit(v)),
    }
}

fn or(a: Expr, b: Expr) -> Expr {
    Expr::BinaryOp { op: BinOp::Or, left: Box::new(a), right: Box::new(b) }
}

/// Reference evaluation of the predicate shapes used below.
fn matches(expr: &Expr, id: i64, customer_id: i64) -> bool {
    let value = |e: &Expr| match e {
        Expr::Column { col } if col.column == "id" => Some(id),
        Expr::Column { col } if col.column == "customer_id" => Some(customer_id),
        Expr::Literal { value } => value.as_i64(),
        Expr::FuncCall { args, .. } => match &args[0] {
            Expr::Column { col } if col.column == "customer_id" => Some(customer_id.abs()),
            _ => None,
        },
        _ => None,
    };
    match expr {
        Expr::BinaryOp { op: BinOp::And, left, right } => matches(left, id, customer_id) && matches(right, id, customer_id),
        Expr::BinaryOp { op: BinOp::Or, left, right } => matches(left, id, customer_id) || matches(right, id, customer_id),
        Expr::BinaryOp { op, left, right } => {
            let (Some(l), Some(r)) = (value(left.as_ref()), value(right.as_ref())) else { return false };
            match op {
                BinOp::Eq => l == r,
                BinOp::Ne => l != r,
                BinOp::Lt => l < r,
                BinOp::Le => l <= r,
                BinOp::Gt => l > r,
                BinOp::Ge => l >= r,
                _ => false,
            }
        }
        Expr::Between { expr, low, high, .. } => {
            let v = value(expr.as_ref()).unwrap_or_default();
            value(low.as_ref()).is_some_and(|l| l <= v) && value(high.as_ref()).is_some_and(|h| v <= h)
        }
        Expr::InList { expr, list, .. } => list.iter().any(|e| value(e) == value(expr.as_ref())),
        _ => false,
    }
}

#[test]
fn test_pruning_never_omits_matching_nodes() {
    let predicates = vec![
        cmp(BinOp::Eq, "customer_id", 150),
        cmp(BinOp::Lt, "customer_id", 100),
        cmp(BinOp::Ge, "customer_id", 100),
        cmp(BinOp::Gt, "customer_id", 98),
        cmp(BinOp::Ne, "customer_id", 5),
        cmp(BinOp::Eq, "id", 3),
        or(cmp(BinOp::Eq, "customer_id", 1), cmp(BinOp::Eq, "customer_id", 120)),
        or(cmp(BinOp::Eq, "customer_id", 1), cmp(BinOp::Eq, "id", 120)),
        Expr::BinaryOp {
            op: BinOp::And,
            left: Box::new(cmp(BinOp::Gt, "customer_id", 10)),
            right: Box::new(cmp(BinOp::Lt, "customer_id", 20)),
        },
        Expr::Between {
            expr: Box::new(shardline_ir::col("customer_id")),
            low: Box::new(shardline_ir::lit(90)),
            high: Box::new(shardline_ir::lit(110)),
            negated: false,
        },
        Expr::InList {
            expr: Box::new(shardline_ir::col("customer_id")),
            list: vec![shardline_ir::lit(3), shardline_ir::lit(199)],
            negated: false,
        },
        shardline_ir::eq(
            Expr::FuncCall { func: "abs".into(), args: vec![shardline_ir::col("customer_id")] },
            shardline_ir::lit(150),
        ),
    ];

    for table in [range_orders(), hash_orders(4)] {
        let Distribution::Sharding(function) = &table.distribution else { unreachable!() };
        for predicate in &predicates {
            let condition = PredicateAnalyzer::new(&table).analyze(Some(predicate));
            let resolved: BTreeSet<DataNode> = DistributionResolver::resolve(
                &table,
                ShardingInput::Condition { condition: &condition, params: &[] },
            )
            .unwrap()
            .nodes
            .into_iter()
            .collect();

            for customer_id in 0..200 {
                if !matches(predicate, 3, customer_id) {
                    continue;
                }
                let home = function.calculate(&ShardingValues::from_row([("customer_id", Value::Int(customer_id))]));
                for node in home {
                    assert!(
                        resolved.contains(&node),
                        "{} pruned {} holding customer_id={}",
                        predicate,
                        node,
                        customer_id
                    );
                }
            }
        }
    }
}

#[test]
fn test_unanalyzable_update_broadcasts_to_every_node() {
    let table = hash_orders(4);
    let stmt = Statement::Update(Update {
        table: TableName::new("orders"),
        assignments: vec![shardline_ast::Assignment { column: "status".into(), value: AstExpr::lit("X") }],
        selection: Some(AstExpr::call("lower", vec![AstExpr::ident("status")]).equals(AstExpr::lit("new"))),
    });
    let predicate = Expr::BinaryOp {
        op: BinOp::Eq,
        left: Box::new(Expr::FuncCall { func: "lower".into(), args: vec![shardline_ir::col("status")] }),
        right: Box::new(shardline_ir::lit("new")),
    };
    let condition = PredicateAnalyzer::new(&table).analyze(Some(&predicate));
    let nodes = DistributionResolver::resolve(&table, ShardingInput::Condition { condition: &condition, params: &[] })
        .unwrap()
        .nodes;

    let set = StatementRewriter::new("shop")
        .rewrite_dml(&stmt, &table, &condition, &nodes, &[])
        .unwrap();

    assert_eq!(set.len(), 4);
    let targets: BTreeSet<String> = set.iter().map(|s| s.node.target.clone()).collect();
    assert_eq!(targets.len(), 4);
}

#[test]
fn test_global_update_fans_out_to_every_replica() {
    let replicas = vec![
        DataNode::new("r1", "db_a", "dict"),
        DataNode::new("r2", "db_b", "dict"),
        DataNode::new("r3", "db_c", "dict"),
    ];
    let table = LogicalTable::new("shop", "dict", columns()).with_distribution(Distribution::Global(replicas));
    let stmt = Statement::Update(Update {
        table: TableName::new("dict"),
        assignments: vec![shardline_ast::Assignment { column: "status".into(), value: AstExpr::placeholder(0) }],
        selection: None,
    });
    let condition = PredicateAnalyzer::new(&table).analyze(None);
    let nodes = DistributionResolver::resolve(&table, ShardingInput::Condition { condition: &condition, params: &[] })
        .unwrap()
        .nodes;

    let set = StatementRewriter::new("shop")
        .rewrite_dml(&stmt, &table, &condition, &nodes, &[Value::from("on")])
        .unwrap();

    assert_eq!(set.len(), 3);
    let normalized: BTreeSet<String> = set
        .iter()
        .map(|s| s.sql.replace(&format!("{}.{}", s.node.schema, s.node.table), "<t>"))
        .collect();
    assert_eq!(normalized.into_iter().collect::<Vec<_>>(), vec!["UPDATE <t> SET status = ?".to_string()]);
}

#[test]
fn test_delete_by_customer_targets_single_node() {
    let table = range_orders();
    let stmt = Statement::Delete(Delete {
        table: TableName::new("orders"),
        selection: Some(AstExpr::ident("customer_id").equals(AstExpr::lit(150))),
    });
    let condition = PredicateAnalyzer::new(&table).analyze(Some(&cmp(BinOp::Eq, "customer_id", 150)));
    let nodes = DistributionResolver::resolve(&table, ShardingInput::Condition { condition: &condition, params: &[] })
        .unwrap()
        .nodes;
    let set = StatementRewriter::new("shop")
        .rewrite_dml(&stmt, &table, &condition, &nodes, &[])
        .unwrap();

    assert!(set.is_proxy());
    let only = set.iter().next().unwrap();
    assert_eq!(only.node.target, "N2");
    assert_eq!(only.sql, "DELETE FROM db_1.orders WHERE customer_id = 150");
}
