//! Table integration tests
//!
//! Exercises the ordered and unordered tables the way the concurrency
//! protocol drives them:
//! - schema-encoded values stored and read back through row latches
//! - adjacency processors observing a frozen neighbourhood
//! - concurrent inserts and removes keeping the key order intact

use pasha_common::{HostId, PartitionId, Partitioner, TableId};
use pasha_storage::{
    Database, FieldType, FieldValue, KeyPacker, OrderedTable, Table, TableDef, TableKind,
    TupleSchema, TupleValue, MAX_KEY,
};
use rand::Rng;
use std::sync::Arc;
use std::thread;

// =============================================================================
// Helpers
// =============================================================================

fn stock_schema() -> TupleSchema {
    TupleSchema::new(vec![FieldType::U32, FieldType::F64, FieldType::FixedStr(12)])
}

fn stock_value(qty: u32) -> TupleValue {
    TupleValue(vec![
        FieldValue::U32(qty),
        FieldValue::F64(qty as f64 * 0.5),
        FieldValue::Str(format!("item-{qty}")),
    ])
}

fn collect_keys(table: &dyn Table, from: u64) -> Vec<u64> {
    let mut keys = Vec::new();
    table.scan(from, &mut |e| {
        keys.push(e.key);
        true
    });
    keys
}

// =============================================================================
// Values through tables
// =============================================================================

#[test]
fn test_schema_values_in_ordered_table() {
    let schema = stock_schema();
    let packer = KeyPacker::new(vec![100, 100_000]).unwrap();
    let db = Database::new(HostId(0), Partitioner::new(1, 1));
    let table = db
        .create_table(
            TableDef {
                table_id: TableId(5),
                kind: TableKind::Ordered,
                value_size: schema.value_size(),
            },
            PartitionId(0),
        )
        .unwrap();

    for item in 0..50u64 {
        let bytes = stock_value(item as u32).serialize(&schema).unwrap();
        table.insert(packer.pack(&[3, item]), &bytes, false).unwrap();
    }

    let row = table.search(packer.pack(&[3, 17])).unwrap();
    let decoded = TupleValue::deserialize(&schema, &row.lock().data).unwrap();
    assert_eq!(decoded, stock_value(17));

    let (lo, hi) = packer.prefix_range(&[3]);
    let in_range: Vec<_> = collect_keys(table.as_ref(), lo)
        .into_iter()
        .take_while(|k| *k < hi)
        .collect();
    assert_eq!(in_range.len(), 50);
}

// =============================================================================
// Adjacency
// =============================================================================

#[test]
fn test_neighbours_include_placeholders() {
    let table = OrderedTable::new(TableId(0), PartitionId(0), 1);
    table.insert(10, &[1], false).unwrap();
    table.insert(20, &[0], true).unwrap();

    let mut next_valid = None;
    table.search_and_update_next_key_info(10, &mut |adj| {
        let next = adj.next.unwrap();
        assert_eq!(next.key, 20);
        next_valid = Some(next.row.lock().is_valid);
        true
    });
    assert_eq!(next_valid, Some(false));

    table.search_and_update_next_key_info(20, &mut |adj| {
        assert_eq!(adj.next.unwrap().key, MAX_KEY);
        true
    });
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_concurrent_inserts_and_removes_stay_ordered() {
    let table = Arc::new(OrderedTable::new(TableId(1), PartitionId(0), 8));
    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for i in 0..500u64 {
                    let key = t * 10_000 + i;
                    table.insert(key, &key.to_le_bytes(), false).unwrap();
                    if rng.gen_bool(0.3) {
                        assert!(table.remove(key).is_some());
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let keys = collect_keys(table.as_ref(), 0);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(*keys.last().unwrap(), MAX_KEY);
    assert_eq!(keys.len(), table.len());
    for k in keys.iter().filter(|k| **k != MAX_KEY) {
        assert_eq!(&table.search(*k).unwrap().lock().data[..], &k.to_le_bytes());
    }
}

#[test]
fn test_unordered_table_concurrent_point_ops() {
    let db = Arc::new(Database::new(HostId(0), Partitioner::new(1, 2)));
    db.create_local_partitions(TableDef {
        table_id: TableId(2),
        kind: TableKind::Unordered,
        value_size: 8,
    })
    .unwrap();

    let handles: Vec<_> = (0..2u32)
        .map(|p| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let table = db.find_table(TableId(2), PartitionId(p)).unwrap();
                for k in 0..1000u64 {
                    table.insert(k, &k.to_le_bytes(), false).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for p in 0..2 {
        assert_eq!(db.find_table(TableId(2), PartitionId(p)).unwrap().len(), 1000);
    }
}
