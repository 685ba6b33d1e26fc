mod common;

use asyncmodel::prelude::*;
use common::{create, menu, names};

#[tokio::test]
async fn test_to_one_accessors() {
    let m = menu().await;
    let margherita = m.db.instance(m.margherita.clone()).unwrap();

    let boxed = margherita.related_object("abox").await.unwrap().unwrap();
    assert_eq!(boxed, m.small_box);
    let price = margherita.related_object("aprice").await.unwrap().unwrap();
    assert_eq!(price.float("amount"), Some(8.5));

    let price = m.db.instance(price).unwrap();
    let back = price.related_object("apizza").await.unwrap().unwrap();
    assert_eq!(back, m.margherita);
}

#[tokio::test]
async fn test_missing_reverse_one_to_one() {
    let m = menu().await;
    let orphan = create(&m.db, "price", fields! { "amount" => 3.0 }).await;
    let orphan = m.db.instance(orphan).unwrap();

    let err = orphan.related_object("apizza").await.unwrap_err();
    assert!(err.is_does_not_exist());
}

#[tokio::test]
async fn test_null_forward_key_resolves_to_none() {
    let m = menu().await;
    let loose = create(&m.db, "pizza", fields! { "name" => "calzone" }).await;
    let loose = m.db.instance(loose).unwrap();
    assert!(loose.related_object("abox").await.unwrap().is_none());
}

#[tokio::test]
async fn test_select_related_skips_the_fetch() {
    let m = menu().await;
    let row = m
        .db
        .objects("pizza")
        .unwrap()
        .select_related(&["box"])
        .get(q!("name" => "diavola"))
        .await
        .unwrap();
    let pizza = m.db.instance(row.into_instance().unwrap()).unwrap();

    let before = m.db.backend().stats();
    let boxed = pizza.related_object("abox").await.unwrap().unwrap();
    assert_eq!(boxed.text("name"), Some("small"));
    assert_eq!(m.db.backend().stats(), before);
}

#[tokio::test]
async fn test_unknown_accessor_and_wrong_shape() {
    let m = menu().await;
    let pizza = m.db.instance(m.margherita.clone()).unwrap();

    match pizza.related("toppings").await {
        Err(ModelError::UnknownAttribute { model, attribute }) => {
            assert_eq!(model, "pizza");
            assert_eq!(attribute, "toppings");
        }
        other => panic!("expected UnknownAttribute, got {:?}", other.map(|_| ())),
    }

    assert!(matches!(
        pizza.many_to_many("abox").await.unwrap_err(),
        ModelError::TypeMismatch(_)
    ));
    assert!(matches!(
        pizza.related_object("atoppings").await.unwrap_err(),
        ModelError::TypeMismatch(_)
    ));
}

#[tokio::test]
async fn test_unsaved_owner_has_no_managers() {
    let m = menu().await;
    let draft = m.db.instance(Record::new("pizza").with("name", "draft")).unwrap();
    assert!(matches!(
        draft.many_to_many("atoppings").await.unwrap_err(),
        ModelError::InvalidQuery(_)
    ));
}

#[tokio::test]
async fn test_many_to_one_proxy_narrows_lazily() {
    let m = menu().await;
    let boxed = m.db.instance(m.small_box.clone()).unwrap();

    let before = m.db.backend().stats();
    let pizzas = boxed.many_to_one("apizza_set").await.unwrap();
    let named = pizzas.filter(q!("name__startswith" => "d")).order_by(&["name"]);
    assert_eq!(m.db.backend().stats(), before);
    assert!(named.to_string().starts_with("<AsyncManyToOneRelatedQuerySet"));

    assert_eq!(names(&named.eval().await.unwrap()), vec!["diavola"]);
    assert_eq!(pizzas.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_many_to_one_bulk_add_is_one_write() {
    let m = menu().await;
    let large = create(&m.db, "box", fields! { "name" => "large" }).await;
    let large = m.db.instance(large).unwrap();
    let pizzas = large.many_to_one("apizza_set").await.unwrap();

    let before = m.db.backend().stats().writes;
    pizzas
        .add(vec![m.margherita.clone(), m.diavola.clone()])
        .await
        .unwrap();
    assert_eq!(m.db.backend().stats().writes, before + 1);
    assert_eq!(pizzas.count().await.unwrap(), 2);

    let small = m.db.instance(m.small_box.clone()).unwrap();
    let left = small.many_to_one("apizza_set").await.unwrap();
    assert!(!left.exists().await.unwrap());
}

#[tokio::test]
async fn test_many_to_one_bulk_add_needs_saved_objects() {
    let m = menu().await;
    let small = m.db.instance(m.small_box.clone()).unwrap();
    let pizzas = small.many_to_one("apizza_set").await.unwrap();

    let unsaved = Record::new("pizza").with("name", "marinara");
    let err = pizzas.add(vec![unsaved.clone()]).await.unwrap_err();
    assert!(matches!(err, ModelError::InvalidQuery(_)));

    let before = m.db.backend().stats().writes;
    pizzas.bulk(false).add(vec![unsaved]).await.unwrap();
    assert_eq!(m.db.backend().stats().writes, before + 1);
    assert_eq!(pizzas.count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_many_to_one_remove_and_clear() {
    let m = menu().await;
    let small = m.db.instance(m.small_box.clone()).unwrap();
    let pizzas = small.many_to_one("apizza_set").await.unwrap();

    pizzas.remove(vec![m.margherita.clone()]).await.unwrap();
    assert_eq!(names(&pizzas.eval().await.unwrap()), vec!["diavola"]);

    let err = pizzas.remove(vec![m.margherita.clone()]).await.unwrap_err();
    assert!(matches!(err, ModelError::InvalidQuery(_)));

    pizzas.clear().await.unwrap();
    assert_eq!(pizzas.count().await.unwrap(), 0);
    let kept = m.db.objects("pizza").unwrap().filter(q!("box__isnull" => true));
    assert_eq!(kept.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_non_nullable_key_refuses_remove() {
    let m = menu().await;
    let margherita = m.db.instance(m.margherita.clone()).unwrap();
    let slices = margherita.many_to_one("aslice_set").await.unwrap();

    let slice = slices.create(fields! { "size" => 4 }).await.unwrap();
    assert_eq!(slice.integer("pizza"), m.margherita.pk());

    assert!(slices.remove(vec![slice]).await.unwrap_err().is_not_supported());
    assert!(slices.clear().await.unwrap_err().is_not_supported());
    assert_eq!(slices.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_many_to_one_set_diffs_membership() {
    let m = menu().await;
    let calzone = create(&m.db, "pizza", fields! { "name" => "calzone" }).await;
    let small = m.db.instance(m.small_box.clone()).unwrap();
    let pizzas = small.many_to_one("apizza_set").await.unwrap().order_by(&["name"]);

    pizzas
        .set(vec![m.diavola.clone(), calzone.clone()], false)
        .await
        .unwrap();
    assert_eq!(names(&pizzas.eval().await.unwrap()), vec!["calzone", "diavola"]);

    pizzas.set(vec![m.margherita.clone()], true).await.unwrap();
    assert_eq!(names(&pizzas.eval().await.unwrap()), vec!["margherita"]);
}

#[tokio::test]
async fn test_failed_set_leaves_membership_untouched() {
    let m = menu().await;
    let small = m.db.instance(m.small_box.clone()).unwrap();
    let pizzas = small.many_to_one("apizza_set").await.unwrap().order_by(&["name"]);

    let unsaved = Record::new("pizza").with("name", "marinara");
    let err = pizzas
        .set(vec![m.margherita.clone(), unsaved.clone()], false)
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::InvalidQuery(_)));
    assert_eq!(names(&pizzas.eval().await.unwrap()), vec!["diavola", "margherita"]);

    let err = pizzas.set(vec![unsaved], true).await.unwrap_err();
    assert!(matches!(err, ModelError::InvalidQuery(_)));
    assert_eq!(pizzas.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_per_object_add_is_all_or_nothing() {
    let m = menu().await;
    let large = create(&m.db, "box", fields! { "name" => "large" }).await;
    let large = m.db.instance(large).unwrap();
    let pizzas = large.many_to_one("apizza_set").await.unwrap().bulk(false);

    // The nameless pizza violates a not-null column after margherita moved.
    let nameless = Record::new("pizza");
    let before = m.db.backend().stats().writes;
    let err = pizzas
        .add(vec![m.margherita.clone(), nameless])
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::Integrity(_)));
    assert_eq!(m.db.backend().stats().writes, before);
    assert_eq!(pizzas.count().await.unwrap(), 0);

    let small = m.db.instance(m.small_box.clone()).unwrap();
    let kept = small.many_to_one("apizza_set").await.unwrap();
    assert_eq!(kept.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_many_to_one_get_or_create_links_owner() {
    let m = menu().await;
    let margherita = m.db.instance(m.margherita.clone()).unwrap();
    let slices = margherita.many_to_one("aslice_set").await.unwrap();

    let (first, created) = slices
        .get_or_create(fields! { "size" => 6 }, Fields::new())
        .await
        .unwrap();
    assert!(created);
    let (again, created) = slices
        .get_or_create(fields! { "size" => 6 }, Fields::new())
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(first, again);

    let diavola = m.db.instance(m.diavola.clone()).unwrap();
    let other = diavola.many_to_one("aslice_set").await.unwrap();
    let (_, created) = other
        .update_or_create(fields! { "size" => 6 }, Fields::new())
        .await
        .unwrap();
    assert!(created);
    let all_slices = m.db.objects("slice").unwrap();
    assert_eq!(all_slices.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_many_to_many_add_with_through_defaults() {
    let m = menu().await;
    let pizza = m.db.instance(m.margherita.clone()).unwrap();
    let toppings = pizza.many_to_many("atoppings").await.unwrap();

    toppings
        .through_defaults(fields! { "position" => 2 })
        .add(vec![m.basil.clone(), m.olive.clone()])
        .await
        .unwrap();
    assert_eq!(names(&toppings.eval().await.unwrap()), vec!["basil", "olive"]);

    let manager = toppings.relation().manager().clone();
    let rows = m.db.run("link_rows", move |_| manager.link_rows()).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.extra.get("position") == Some(&Value::Integer(2))));

    let err = toppings
        .through_defaults(fields! { "weight" => 1 })
        .add(vec![m.bacon.clone()])
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::FieldNotFound { .. }));
}

#[tokio::test]
async fn test_many_to_many_is_symmetric() {
    let m = menu().await;
    let pizza = m.db.instance(m.diavola.clone()).unwrap();
    let toppings = pizza.many_to_many("atoppings").await.unwrap();
    toppings.add(vec![m.bacon.clone()]).await.unwrap();

    let bacon = m.db.instance(m.bacon.clone()).unwrap();
    let pizzas = bacon.many_to_many("apizza_set").await.unwrap();
    assert_eq!(names(&pizzas.eval().await.unwrap()), vec!["diavola"]);

    pizzas.remove(vec![m.diavola.clone()]).await.unwrap();
    assert!(!toppings.exists().await.unwrap());
}

#[tokio::test]
async fn test_many_to_many_clear_and_set() {
    let m = menu().await;
    let pizza = m.db.instance(m.margherita.clone()).unwrap();
    let toppings = pizza.many_to_many("atoppings").await.unwrap();

    toppings
        .add(vec![m.bacon.clone(), m.olive.clone()])
        .await
        .unwrap();
    toppings
        .set(vec![m.olive.clone(), m.basil.clone()], false)
        .await
        .unwrap();
    assert_eq!(names(&toppings.eval().await.unwrap()), vec!["basil", "olive"]);

    toppings.set(vec![m.bacon.clone()], true).await.unwrap();
    assert_eq!(names(&toppings.eval().await.unwrap()), vec!["bacon"]);

    toppings.clear().await.unwrap();
    assert_eq!(toppings.count().await.unwrap(), 0);
    let all = m.db.objects("topping").unwrap();
    assert_eq!(all.count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_many_to_many_create_family_links() {
    let m = menu().await;
    let pizza = m.db.instance(m.margherita.clone()).unwrap();
    let toppings = pizza
        .many_to_many("atoppings")
        .await
        .unwrap()
        .through_defaults(fields! { "position" => 1 });

    let chili = toppings.create(fields! { "name" => "chili" }).await.unwrap();
    assert_eq!(chili.text("name"), Some("chili"));

    // Only linked toppings are searched, so an unlinked bacon collides.
    let err = toppings
        .get_or_create(fields! { "name" => "bacon" }, Fields::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::Integrity(_)));

    let (existing, created) = toppings
        .get_or_create(fields! { "name" => "chili" }, Fields::new())
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(existing, chili);

    let (updated, created) = toppings
        .update_or_create(fields! { "name" => "chili" }, fields! { "vegan" => true })
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(updated.get("vegan"), Some(&Value::Boolean(true)));
    assert_eq!(toppings.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_prefetch_related_travels_with_records() {
    let m = menu().await;
    let pizza = m.db.instance(m.margherita.clone()).unwrap();
    pizza
        .many_to_many("atoppings")
        .await
        .unwrap()
        .add(vec![m.olive.clone(), m.bacon.clone()])
        .await
        .unwrap();

    let rows = m
        .db
        .objects("pizza")
        .unwrap()
        .prefetch_related(&["toppings"])
        .order_by(&["name"])
        .eval()
        .await
        .unwrap();
    let diavola = rows[0].as_instance().unwrap();
    let margherita = rows[1].as_instance().unwrap();
    assert!(diavola.prefetched("toppings").unwrap().is_empty());
    let loaded: Vec<&str> = margherita
        .prefetched("toppings")
        .unwrap()
        .iter()
        .filter_map(|t| t.text("name"))
        .collect();
    assert_eq!(loaded, vec!["bacon", "olive"]);
}
