use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dom_mirror::{DomSerializer, NodeDescriptor, NodeRegistry, StableId};
use serde_json::{json, Value};

/// Document with `rows` list items, each holding a link and a text node
fn document(rows: u32) -> NodeDescriptor {
    let items: Vec<Value> = (0..rows)
        .map(|i| {
            let base = 10 + i * 3;
            json!({
                "nodeId": base, "backendNodeId": base, "nodeType": 1, "nodeName": "LI",
                "attributes": ["class", format!("row row-{}", i)],
                "children": [{
                    "nodeId": base + 1, "backendNodeId": base + 1, "nodeType": 1, "nodeName": "A",
                    "attributes": ["href", format!("/item/{}", i)],
                    "children": [{
                        "nodeId": base + 2, "backendNodeId": base + 2, "nodeType": 3,
                        "nodeName": "#text", "nodeValue": format!("Item {}", i)
                    }]
                }]
            })
        })
        .collect();

    serde_json::from_value(json!({
        "nodeId": 1, "backendNodeId": 1, "nodeType": 9, "nodeName": "#document",
        "children": [{"nodeId": 2, "backendNodeId": 2, "nodeType": 1, "nodeName": "UL", "children": items}]
    }))
    .unwrap()
}

fn bench_load(c: &mut Criterion) {
    let doc = document(2_000);
    c.bench_function("load_root_6k_nodes", |b| {
        let mut registry = NodeRegistry::new();
        b.iter(|| registry.load_root(black_box(&doc)).unwrap())
    });
}

fn bench_churn(c: &mut Criterion) {
    let doc = document(2_000);
    let mut registry = NodeRegistry::new();
    registry.load_root(&doc).unwrap();
    let rows: Vec<NodeDescriptor> = doc.children.as_ref().unwrap()[0]
        .children
        .clone()
        .unwrap();

    c.bench_function("replace_children_same_ids", |b| {
        b.iter(|| registry.replace_children(StableId(2), black_box(&rows)).unwrap())
    });
    c.bench_function("attribute_churn", |b| {
        let mut n = 0u32;
        b.iter(|| {
            n = n.wrapping_add(1);
            let id = StableId(10 + (n % 2_000) * 3);
            registry.set_attribute(id, "class", if n % 2 == 0 { "row a" } else { "row b" })
        })
    });
}

fn bench_serialize(c: &mut Criterion) {
    let mut registry = NodeRegistry::new();
    registry.load_root(&document(2_000)).unwrap();
    let serializer = DomSerializer::new();
    c.bench_function("serialize_6k_nodes", |b| {
        b.iter(|| serializer.serialize_root(black_box(&registry)))
    });
}

criterion_group!(benches, bench_load, bench_churn, bench_serialize);
criterion_main!(benches);
