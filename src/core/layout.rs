//! Layout adapter for newly created tables
//!
//! The session only ever asks for positions of a few tables ("by id" mode):
//! every other visible table stays where it is. [`GridLayout`] puts each new
//! table next to a related table if one is already placed, then walks outward
//! over a grid of table-sized cells until it finds a free one.

use petgraph::graphmap::UnGraphMap;
use uuid::Uuid;

use crate::core::schema::{Relationship, Table};

/// Layout configuration
#[derive(Clone, Debug, PartialEq)]
pub struct LayoutConfig {
    /// Horizontal spacing between tables
    pub horizontal_spacing: f64,
    /// Vertical spacing between tables
    pub vertical_spacing: f64,
    /// Position of the first table on an empty canvas
    pub start_x: f64,
    pub start_y: f64,
    /// Estimated table width for overlap checks
    pub table_width: f64,
    /// Estimated table height for overlap checks
    pub table_height: f64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            horizontal_spacing: 80.0,
            vertical_spacing: 100.0,
            start_x: 100.0,
            start_y: 100.0,
            table_width: 280.0,
            table_height: 250.0,
        }
    }
}

impl LayoutConfig {
    fn cell_width(&self) -> f64 {
        self.table_width + self.horizontal_spacing
    }

    fn cell_height(&self) -> f64 {
        self.table_height + self.vertical_spacing
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TablePosition {
    pub table_id: Uuid,
    pub x: f64,
    pub y: f64,
}

pub trait LayoutEngine: Send + Sync {
    /// Positions for the tables in `ids`; the other tables are fixed obstacles
    fn place(&self, tables: &[Table], relationships: &[Relationship], ids: &[Uuid])
    -> Vec<TablePosition>;
}

#[derive(Clone, Debug, Default)]
pub struct GridLayout {
    config: LayoutConfig,
}

impl GridLayout {
    pub fn new(config: LayoutConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LayoutConfig {
        &self.config
    }

    fn overlaps(&self, x: f64, y: f64, placed: &[(f64, f64)]) -> bool {
        placed.iter().any(|(px, py)| {
            (x - px).abs() < self.config.cell_width() && (y - py).abs() < self.config.cell_height()
        })
    }

    /// Where to start looking for a free cell
    fn anchor(
        &self,
        id: Uuid,
        graph: &UnGraphMap<Uuid, ()>,
        positions: &[(Uuid, (f64, f64))],
    ) -> (f64, f64) {
        let neighbor = graph
            .neighbors(id)
            .find_map(|n| positions.iter().find(|(pid, _)| *pid == n).map(|(_, p)| *p));
        if let Some((x, y)) = neighbor {
            return (x + self.config.cell_width(), y);
        }

        let right_edge = positions
            .iter()
            .map(|(_, (x, _))| *x)
            .fold(f64::NEG_INFINITY, f64::max);
        if right_edge.is_finite() {
            (right_edge + self.config.cell_width(), self.config.start_y)
        } else {
            (self.config.start_x, self.config.start_y)
        }
    }

    /// First free cell in rings of growing radius around `anchor`
    fn free_cell(&self, anchor: (f64, f64), placed: &[(f64, f64)]) -> (f64, f64) {
        let (ax, ay) = anchor;
        // A ring of radius r has 8r cells and one table can block at most 4
        let limit = placed.len() as i64 + 1;

        for r in 0..=limit {
            for dy in -r..=r {
                for dx in -r..=r {
                    if dx.abs().max(dy.abs()) != r {
                        continue;
                    }
                    let x = ax + dx as f64 * self.config.cell_width();
                    let y = ay + dy as f64 * self.config.cell_height();
                    if !self.overlaps(x, y, placed) {
                        return (x, y);
                    }
                }
            }
        }

        (ax + (limit + 1) as f64 * self.config.cell_width(), ay)
    }
}

impl LayoutEngine for GridLayout {
    fn place(
        &self,
        tables: &[Table],
        relationships: &[Relationship],
        ids: &[Uuid],
    ) -> Vec<TablePosition> {
        let mut graph = UnGraphMap::<Uuid, ()>::new();
        for table in tables {
            graph.add_node(table.id);
        }
        for rel in relationships {
            if graph.contains_node(rel.source.table_id) && graph.contains_node(rel.target.table_id) {
                graph.add_edge(rel.source.table_id, rel.target.table_id, ());
            }
        }

        let mut positions: Vec<(Uuid, (f64, f64))> = tables
            .iter()
            .filter(|t| !ids.contains(&t.id))
            .map(|t| (t.id, (t.x, t.y)))
            .collect();

        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            if !graph.contains_node(*id) {
                continue;
            }
            let anchor = self.anchor(*id, &graph, &positions);
            let occupied: Vec<(f64, f64)> = positions.iter().map(|(_, p)| *p).collect();
            let (x, y) = self.free_cell(anchor, &occupied);

            positions.push((*id, (x, y)));
            result.push(TablePosition { table_id: *id, x, y });
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data_types::DataType;
    use crate::core::schema::{Endpoint, Field};

    fn table(name: &str, x: f64, y: f64) -> Table {
        Table::new(name)
            .add_field(Field::new("id", DataType::new("bigint", "bigint")).primary_key())
            .with_position(x, y)
    }

    #[test]
    fn test_first_table_on_empty_canvas() {
        let layout = GridLayout::default();
        let t = table("a", 0.0, 0.0);
        let placed = layout.place(&[t.clone()], &[], &[t.id]);

        assert_eq!(placed, vec![TablePosition { table_id: t.id, x: 100.0, y: 100.0 }]);
    }

    #[test]
    fn test_new_table_placed_next_to_related_table() {
        let layout = GridLayout::default();
        let users = table("users", 500.0, 500.0);
        let other = table("other", 100.0, 100.0);
        let orders = table("orders", 0.0, 0.0);
        let rel = Relationship::new(
            "orders_user_fk",
            Endpoint::new(orders.id, orders.fields[0].id),
            Endpoint::new(users.id, users.fields[0].id),
        );

        let placed = layout.place(&[users, other, orders.clone()], &[rel], &[orders.id]);
        assert_eq!(placed[0].x, 500.0 + 360.0);
        assert_eq!(placed[0].y, 500.0);
    }

    #[test]
    fn test_placed_tables_never_overlap() {
        let config = LayoutConfig::default();
        let layout = GridLayout::new(config.clone());
        let fixed: Vec<Table> = (0..4).map(|i| table(&format!("t{i}"), 100.0 + i as f64 * 10.0, 100.0)).collect();
        let new: Vec<Table> = (0..5).map(|i| table(&format!("n{i}"), 0.0, 0.0)).collect();
        let ids: Vec<Uuid> = new.iter().map(|t| t.id).collect();
        let all: Vec<Table> = fixed.iter().chain(new.iter()).cloned().collect();

        let placed = layout.place(&all, &[], &ids);
        assert_eq!(placed.len(), 5);

        let mut boxes: Vec<(f64, f64)> = fixed.iter().map(|t| (t.x, t.y)).collect();
        for p in &placed {
            for (x, y) in &boxes {
                assert!(
                    (p.x - x).abs() >= config.table_width + config.horizontal_spacing
                        || (p.y - y).abs() >= config.table_height + config.vertical_spacing
                );
            }
            boxes.push((p.x, p.y));
        }
    }

    #[test]
    fn test_unknown_ids_are_ignored() {
        let layout = GridLayout::default();
        assert!(layout.place(&[], &[], &[Uuid::new_v4()]).is_empty());
    }
}
