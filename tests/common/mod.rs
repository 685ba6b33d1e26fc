#![allow(dead_code)]

use asyncmodel::prelude::*;

pub type Db = AsyncDatabase<MemoryBackend>;

/// Pizzas come in a box, carry a one-to-one price, many toppings and
/// slices that cannot outlive them.
pub fn schema() -> Vec<ModelSchema> {
    vec![
        ModelSchema::new("box").column(Column::new("name", DataType::Text).not_null().unique()),
        ModelSchema::new("price")
            .column(Column::new("amount", DataType::Float).not_null())
            .column(Column::new("currency", DataType::Text).default_value("usd"))
            .column(Column::new("listed", DataType::Date))
            .get_latest_by(&["listed"]),
        ModelSchema::new("topping")
            .column(Column::new("name", DataType::Text).not_null().unique())
            .column(Column::new("vegan", DataType::Boolean).default_value(false))
            .ordering(&["name"]),
        ModelSchema::new("pizza")
            .column(Column::new("name", DataType::Text).not_null())
            .foreign_key(ForeignKey::new("box", "box").nullable().on_delete(OnDelete::SetNull))
            .one_to_one(ForeignKey::new("price", "price").nullable().on_delete(OnDelete::SetNull))
            .many_to_many(
                ManyToMany::new("toppings", "topping")
                    .through_column(Column::new("position", DataType::Integer).default_value(0)),
            ),
        ModelSchema::new("slice")
            .column(Column::new("size", DataType::Integer).not_null())
            .foreign_key(ForeignKey::new("pizza", "pizza")),
    ]
}

pub fn backend_with(configure: impl FnOnce(asyncmodel::storage::MemoryBackendBuilder) -> asyncmodel::storage::MemoryBackendBuilder) -> MemoryBackend {
    let mut builder = MemoryBackend::builder();
    for model in schema() {
        builder = builder.model(model);
    }
    configure(builder).build().unwrap()
}

pub fn backend() -> MemoryBackend {
    backend_with(|builder| builder.alias("replica"))
}

pub fn database() -> Db {
    AsyncDatabase::with_config(backend(), BridgeConfig::new().max_workers(4)).unwrap()
}

pub async fn create(db: &Db, model: &str, fields: Fields) -> Record {
    db.objects(model).unwrap().create(fields).await.unwrap()
}

pub struct Menu {
    pub db: Db,
    pub bacon: Record,
    pub olive: Record,
    pub basil: Record,
    pub small_box: Record,
    pub margherita: Record,
    pub diavola: Record,
}

/// A small menu: two pizzas in one box, three toppings, two prices.
pub async fn menu() -> Menu {
    let db = database();
    let small_box = create(&db, "box", fields! { "name" => "small" }).await;
    let bacon = create(&db, "topping", fields! { "name" => "bacon" }).await;
    let olive = create(&db, "topping", fields! { "name" => "olive", "vegan" => true }).await;
    let basil = create(&db, "topping", fields! { "name" => "basil", "vegan" => true }).await;

    let cheap = create(
        &db,
        "price",
        fields! {
            "amount" => 8.5,
            "listed" => chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        },
    )
    .await;
    let pricey = create(
        &db,
        "price",
        fields! {
            "amount" => 12.0,
            "currency" => "eur",
            "listed" => chrono::NaiveDate::from_ymd_opt(2024, 5, 20).unwrap(),
        },
    )
    .await;

    let margherita = create(
        &db,
        "pizza",
        fields! {
            "name" => "margherita",
            "box" => small_box.pk(),
            "price" => cheap.pk(),
        },
    )
    .await;
    let diavola = create(
        &db,
        "pizza",
        fields! {
            "name" => "diavola",
            "box" => small_box.pk(),
            "price" => pricey.pk(),
        },
    )
    .await;

    Menu {
        db,
        bacon,
        olive,
        basil,
        small_box,
        margherita,
        diavola,
    }
}

pub fn names(rows: &[Row]) -> Vec<String> {
    rows.iter()
        .map(|row| match row {
            Row::Flat(value) => value.to_string(),
            other => other
                .get("name")
                .map(ToString::to_string)
                .unwrap_or_default(),
        })
        .collect()
}
