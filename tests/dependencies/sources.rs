use async_trait::async_trait;
use flowline::{Error, Item, Source};

const WORDS: [&str; 8] = [
    "amber", "basalt", "cobalt", "dune", "ember", "fjord", "garnet", "heron",
];

/// Generates `total` items, each carrying a `text` payload of a few words and
/// a 1-based `count`.
pub struct RandomTextSource {
    total: u64,
    emitted: u64,
}

impl RandomTextSource {
    pub fn new(total: u64) -> Self {
        RandomTextSource { total, emitted: 0 }
    }
}

#[async_trait]
impl Source for RandomTextSource {
    async fn pop(&mut self) -> Result<Option<Item>, Error> {
        if self.emitted >= self.total {
            return Ok(None);
        }
        self.emitted += 1;
        let n = self.emitted;
        let text = format!(
            "{} {} {} {n}",
            WORDS[(n % 8) as usize],
            WORDS[(n % 5) as usize],
            WORDS[(n % 3) as usize],
        );
        let mut item = Item::new();
        item.payload.insert("text".into(), text.into());
        item.payload.insert("count".into(), n.into());
        Ok(Some(item))
    }
}

/// Source over a fixed list of prepared items, emitted in order.
pub struct ItemSource {
    items: std::vec::IntoIter<Item>,
}

impl ItemSource {
    pub fn new(items: Vec<Item>) -> Self {
        ItemSource {
            items: items.into_iter(),
        }
    }
}

#[async_trait]
impl Source for ItemSource {
    async fn pop(&mut self) -> Result<Option<Item>, Error> {
        Ok(self.items.next())
    }
}

/// Emits a few good items, then fails.
pub struct FailingSource {
    remaining: u64,
}

impl FailingSource {
    pub fn new(good_items: u64) -> Self {
        FailingSource {
            remaining: good_items,
        }
    }
}

#[async_trait]
impl Source for FailingSource {
    async fn pop(&mut self) -> Result<Option<Item>, Error> {
        if self.remaining == 0 {
            return Err(Error::SourceError("backing store went away".into()));
        }
        self.remaining -= 1;
        Ok(Some(text_item("still fine")))
    }
}

/// A fresh item with a `text` payload, the shape most stages expect.
pub fn text_item(text: &str) -> Item {
    let mut item = Item::new();
    item.payload.insert("text".into(), text.into());
    item
}
