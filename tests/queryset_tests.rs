mod common;

use std::collections::BTreeSet;

use asyncmodel::prelude::*;
use common::{create, database, menu, names};
use futures::StreamExt;

#[tokio::test]
async fn test_narrowing_does_no_io() {
    let m = menu().await;
    let before = m.db.backend().stats().blocking_calls;

    let toppings = m.db.objects("topping").unwrap();
    let narrowed = toppings
        .filter(q! { "vegan" => true })
        .exclude(q! { "name" => "basil" })
        .order_by(&["-name"])
        .slice(..5)
        .select_related(&[])
        .only(&["name"]);

    assert_eq!(m.db.backend().stats().blocking_calls, before);
    assert_eq!(narrowed.model_name(), "topping");
    assert_eq!(names(&narrowed.eval().await.unwrap()), vec!["olive"]);
    assert_eq!(m.db.backend().stats().blocking_calls, before + 1);
}

#[tokio::test]
async fn test_default_ordering_and_reverse() {
    let m = menu().await;
    let toppings = m.db.objects("topping").unwrap();

    assert_eq!(
        names(&toppings.eval().await.unwrap()),
        vec!["bacon", "basil", "olive"]
    );
    assert_eq!(
        names(&toppings.reverse().eval().await.unwrap()),
        vec!["olive", "basil", "bacon"]
    );
}

#[tokio::test]
async fn test_filter_through_relations() {
    let m = menu().await;
    let pizzas = m.db.objects("pizza").unwrap();

    let in_euros = pizzas.filter(q! { "price__currency" => "eur" });
    assert_eq!(names(&in_euros.eval().await.unwrap()), vec!["diavola"]);

    let boxed = pizzas
        .filter(q! { "box__name__startswith" => "sm" })
        .order_by(&["name"]);
    assert_eq!(
        names(&boxed.eval().await.unwrap()),
        vec!["diavola", "margherita"]
    );

    let either = pizzas
        .filter(Q::new("price__amount__lt", 9.0) | Q::new("name__icontains", "DIAV"))
        .count()
        .await
        .unwrap();
    assert_eq!(either, 2);

    let err = pizzas.filter(q! { "crust" => "thin" }).count().await.unwrap_err();
    assert!(matches!(err, ModelError::FieldNotFound { .. }));
}

#[tokio::test]
async fn test_get_errors() {
    let m = menu().await;
    let pizzas = m.db.objects("pizza").unwrap();

    let found = pizzas.get(q! { "name" => "diavola" }).await.unwrap();
    assert_eq!(found.as_instance().unwrap().pk(), m.diavola.pk());

    let err = pizzas.get(q! { "name" => "hawaii" }).await.unwrap_err();
    assert!(err.is_does_not_exist());
    assert_eq!(err.to_string(), "pizza matching query does not exist");

    let err = pizzas.get(Q::All).await.unwrap_err();
    assert!(matches!(
        err,
        ModelError::MultipleObjectsReturned { count: 2, .. }
    ));
}

#[tokio::test]
async fn test_slicing_and_items() {
    let m = menu().await;
    let toppings = m.db.objects("topping").unwrap();

    assert_eq!(names(&toppings.slice(1..).eval().await.unwrap()), vec!["basil", "olive"]);
    assert_eq!(names(&toppings.slice(1..).slice(..1).eval().await.unwrap()), vec!["basil"]);
    assert_eq!(toppings.slice(5..).count().await.unwrap(), 0);
    let far = toppings.slice(usize::MAX..).slice(1..).slice(..usize::MAX);
    assert_eq!(far.count().await.unwrap(), 0);

    let last = toppings.item(-1).await.unwrap();
    assert_eq!(last.get("name"), Some(&Value::from("olive")));
    let err = toppings.item(3).await.unwrap_err();
    assert!(matches!(err, ModelError::IndexOutOfRange { index: 3, len: 3 }));

    assert!(toppings.slice_stepped(0..3, 2).is_err());

    let err = toppings.slice(..1).filter(q! { "name" => "bacon" }).eval().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid query: Cannot filter a query once a slice has been taken."
    );
}

#[tokio::test]
async fn test_size_queries_need_await() {
    let m = menu().await;
    let toppings = m.db.objects("topping").unwrap();

    assert!(toppings.len().unwrap_err().is_not_supported());
    assert!(toppings.is_empty().unwrap_err().is_not_supported());
    assert_eq!(toppings.count().await.unwrap(), 3);
    assert!(toppings.exists().await.unwrap());
    assert!(!toppings.none().exists().await.unwrap());
}

#[tokio::test]
async fn test_values_and_values_list() {
    let m = menu().await;
    let toppings = m.db.objects("topping").unwrap();

    let rows = toppings.values(&["name", "vegan"]).eval().await.unwrap();
    assert_eq!(rows[0], Row::Values(fields! { "name" => "bacon", "vegan" => false }));

    let flat = toppings
        .values_list(&["name"], ValuesListMode::Flat)
        .eval()
        .await
        .unwrap();
    assert_eq!(flat, vec![
        Row::Flat(Value::from("bacon")),
        Row::Flat(Value::from("basil")),
        Row::Flat(Value::from("olive")),
    ]);

    let err = toppings
        .values_list(&["name", "vegan"], ValuesListMode::Flat)
        .eval()
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::InvalidQuery(_)));

    let pairs = m
        .db
        .objects("pizza")
        .unwrap()
        .order_by(&["name"])
        .values_list(&["name", "price__amount"], ValuesListMode::Tuple)
        .eval()
        .await
        .unwrap();
    assert_eq!(pairs[0], Row::Tuple(vec![Value::from("diavola"), Value::Float(12.0)]));

    let distinct_flags = toppings
        .values_list(&["vegan"], ValuesListMode::Flat)
        .order_by(&["vegan"])
        .distinct(&[])
        .eval()
        .await
        .unwrap();
    assert_eq!(distinct_flags.len(), 2);
}

#[tokio::test]
async fn test_annotations_and_aggregates() {
    let m = menu().await;
    let prices = m.db.objects("price").unwrap();

    let totals = prices
        .aggregate(vec![
            ("total".to_string(), Expr::sum("amount")),
            ("cheapest".to_string(), Expr::min("amount")),
            ("count".to_string(), Expr::count("*")),
        ])
        .await
        .unwrap();
    assert_eq!(totals["total"], Value::Float(20.5));
    assert_eq!(totals["cheapest"], Value::Float(8.5));
    assert_eq!(totals["count"], Value::Integer(2));

    let pizzas = m
        .db
        .objects("pizza")
        .unwrap()
        .annotate(vec![("cost".to_string(), Expr::f("price__amount"))])
        .filter(q! { "cost__gt" => 10.0 });
    let rows = pizzas.eval().await.unwrap();
    assert_eq!(names(&rows), vec!["diavola"]);
    assert_eq!(rows[0].get("cost"), Some(&Value::Float(12.0)));

    let hidden = m
        .db
        .objects("pizza")
        .unwrap()
        .alias(vec![("cost".to_string(), Expr::f("price__amount"))])
        .order_by(&["cost"])
        .first()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hidden.get("name"), Some(&Value::from("margherita")));
    assert_eq!(hidden.get("cost"), None);
}

#[tokio::test]
async fn test_dates_latest_and_earliest() {
    let m = menu().await;
    let prices = m.db.objects("price").unwrap();

    let months = prices
        .dates("listed", DatePart::Month, SortOrder::Desc)
        .eval()
        .await
        .unwrap();
    let may = chrono::NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
    assert_eq!(months[0], Row::Flat(Value::Date(may)));
    assert_eq!(months.len(), 2);

    let latest = prices.latest(&[]).await.unwrap();
    assert_eq!(latest.get("currency"), Some(&Value::from("eur")));
    let earliest = prices.earliest(&["amount"]).await.unwrap();
    assert_eq!(earliest.get("amount"), Some(&Value::Float(8.5)));

    let err = m.db.objects("box").unwrap().latest(&[]).await.unwrap_err();
    assert!(matches!(err, ModelError::InvalidQuery(_)));

    let err = m.db.objects("topping").unwrap().dates("name", DatePart::Day, SortOrder::Asc).eval().await.unwrap_err();
    assert!(matches!(err, ModelError::InvalidQuery(_)));
}

#[tokio::test]
async fn test_create_family() {
    let db = database();
    let boxes = db.objects("box").unwrap();

    let (large, created) = boxes
        .get_or_create(fields! { "name" => "large" }, fields!())
        .await
        .unwrap();
    assert!(created);
    let (again, created) = boxes
        .get_or_create(fields! { "name" => "large" }, fields!())
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(again, large);

    let (renamed, created) = boxes
        .update_or_create(fields! { "name" => "large" }, fields! { "name" => "family" })
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(renamed.text("name"), Some("family"));

    let err = boxes.create(fields! { "name" => "family" }).await.unwrap_err();
    assert!(matches!(err, ModelError::Integrity(_)));
    assert_eq!(boxes.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_bulk_operations() {
    let db = database();
    let toppings = db.objects("topping").unwrap();

    let created = toppings
        .bulk_create(
            vec![
                Record::new("topping").with("name", "ham"),
                Record::new("topping").with("name", "egg"),
                Record::new("topping").with("name", "ham"),
            ],
            BulkOptions::default().ignore_conflicts(),
        )
        .await
        .unwrap();
    assert_eq!(created.iter().filter(|r| r.pk().is_some()).count(), 2);

    let err = toppings
        .bulk_create(vec![Record::new("topping").with("name", "corn")], BulkOptions::default().batch_size(0))
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::InvalidQuery(_)));

    let mut saved: Vec<Record> = created.into_iter().filter(|r| r.pk().is_some()).collect();
    for record in saved.iter_mut() {
        record.set("vegan", true);
    }
    assert_eq!(toppings.bulk_update(saved, &["vegan"], None).await.unwrap(), 2);
    let updated = toppings
        .filter(q! { "vegan" => true })
        .order_by(&["pk"])
        .eval()
        .await
        .unwrap();
    assert_eq!(names(&updated), vec!["ham", "egg"]);
    assert!(updated
        .iter()
        .all(|row| row.get("vegan") == Some(&Value::Boolean(true))));

    let by_name = toppings.in_bulk(None, "name").await.unwrap();
    assert_eq!(by_name.len(), 2);
    assert!(by_name.contains_key(&Value::from("egg")));
    let err = toppings.in_bulk(None, "vegan").await.unwrap_err();
    assert!(matches!(err, ModelError::InvalidQuery(_)));
}

#[tokio::test]
async fn test_update_and_delete() {
    let m = menu().await;
    let pizzas = m.db.objects("pizza").unwrap();

    let updated = pizzas
        .filter(q! { "name" => "diavola" })
        .update(fields! { "name" => "inferno" })
        .await
        .unwrap();
    assert_eq!(updated, 1);

    let err = pizzas.slice(..1).delete().await.unwrap_err();
    assert!(matches!(err, ModelError::InvalidQuery(_)));

    let summary = m.db.objects("box").unwrap().delete().await.unwrap();
    assert_eq!(summary.total, 1);
    assert_eq!(pizzas.filter(q! { "box__isnull" => true }).count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_set_operations() {
    let m = menu().await;
    let toppings = m.db.objects("topping").unwrap();
    let vegan = toppings.filter(q! { "vegan" => true });
    let b_names = toppings.filter(q! { "name__startswith" => "b" });

    assert_eq!(names(&(&vegan & &b_names).unwrap().eval().await.unwrap()), vec!["basil"]);
    let either: BTreeSet<String> = names(&(&vegan | &b_names).unwrap().eval().await.unwrap())
        .into_iter()
        .collect();
    let mut expected: BTreeSet<String> = names(&vegan.eval().await.unwrap()).into_iter().collect();
    expected.extend(names(&b_names.eval().await.unwrap()));
    assert_eq!(either, expected);
    assert_eq!(either.len(), 3);

    let union = vegan.union(&[&b_names], false).order_by(&["name"]);
    assert_eq!(union.count().await.unwrap(), 3);
    let all = vegan.union(&[&b_names], true);
    assert_eq!(all.count().await.unwrap(), 4);
    assert_eq!(
        names(&vegan.difference(&[&b_names]).eval().await.unwrap()),
        vec!["olive"]
    );

    let boxes = m.db.objects("box").unwrap();
    let err = toppings.and(&boxes).unwrap_err();
    assert!(matches!(err, ModelError::TypeMismatch(_)));
}

#[tokio::test]
async fn test_chunked_iterator_and_stream() {
    let m = menu().await;
    let toppings = m.db.objects("topping").unwrap();

    let mut cursor = toppings.iterator(Some(2)).await.unwrap();
    let first = cursor.next_chunk().await.unwrap().unwrap();
    assert_eq!(names(&first), vec!["bacon", "basil"]);
    let second = cursor.next_chunk().await.unwrap().unwrap();
    assert_eq!(names(&second), vec!["olive"]);
    assert!(cursor.next_chunk().await.unwrap().is_none());

    let streamed: Vec<_> = toppings.iterator(None).await.unwrap().into_stream().collect().await;
    assert_eq!(streamed.len(), 3);

    let rows: Vec<Row> = toppings
        .stream()
        .map(|row| row.unwrap())
        .collect()
        .await;
    assert_eq!(names(&rows), vec!["bacon", "basil", "olive"]);

    assert!(toppings.iterator(Some(0)).await.is_err());
}

#[tokio::test]
async fn test_raw_and_explain() {
    let m = menu().await;
    let toppings = m.db.objects("topping").unwrap();

    let raw = toppings.raw(
        RawQuery::new("SELECT * FROM topping WHERE vegan = %s ORDER BY name DESC").params([true]),
    );
    assert_eq!(names(&raw.eval().await.unwrap()), vec!["olive", "basil"]);

    let plan = toppings
        .filter(q! { "vegan" => true })
        .select_for_update(LockOptions::default().nowait())
        .explain(None)
        .await
        .unwrap();
    assert!(plan.contains("FILTER"));
    assert!(plan.contains("LOCK"));

    let json = toppings.explain(Some("json")).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed["model"], "topping");

    assert!(toppings.explain(Some("yaml")).await.is_err());
}

#[tokio::test]
async fn test_using_other_alias() {
    let m = menu().await;
    let replica = m.db.objects("topping").unwrap().using("replica");
    assert_eq!(replica.count().await.unwrap(), 0);
    replica.create(fields! { "name" => "corn" }).await.unwrap();
    assert_eq!(replica.count().await.unwrap(), 1);
    assert_eq!(m.db.objects("topping").unwrap().count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_slice_then_item_over_ordered_prices() {
    let db = database();
    for amount in [49.99, 9.99, 29.99] {
        create(&db, "price", fields! { "amount" => amount }).await;
    }
    let prices = db.objects("price").unwrap();

    let second = prices.order_by(&["amount"]).slice(1..).item(0).await.unwrap();
    assert_eq!(second.get("amount"), Some(&Value::Float(29.99)));

    let cheap = prices.filter(q! { "amount__lt" => 30.0 });
    assert_eq!(cheap.count().await.unwrap(), cheap.eval().await.unwrap().len());
}
