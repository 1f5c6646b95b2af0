//! Renderer abstraction and an SVG backend.

use crate::canvas::Canvas;
use crate::comments::CommentThread;
use crate::presence::{CursorPosition, ReactionEvent};
use crate::shapes::{Shape, ShapeStyle};

/// Stroke colour used to outline selected shapes.
pub const SELECTION_COLOR: &str = "#3b82f6";

/// Context for a single render frame.
pub struct RenderContext<'a> {
    /// The canvas to render.
    pub canvas: &'a Canvas,
    /// Comment threads, bottom to top.
    pub threads: &'a [CommentThread],
    /// Other participants' cursors, keyed by connection id.
    pub cursors: Vec<(&'a str, CursorPosition)>,
    /// Reactions still visible this frame.
    pub reactions: Vec<&'a ReactionEvent>,
}

impl<'a> RenderContext<'a> {
    pub fn new(canvas: &'a Canvas) -> Self {
        Self {
            canvas,
            threads: &[],
            cursors: Vec::new(),
            reactions: Vec::new(),
        }
    }

    pub fn with_threads(mut self, threads: &'a [CommentThread]) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_cursors(mut self, cursors: Vec<(&'a str, CursorPosition)>) -> Self {
        self.cursors = cursors;
        self
    }

    pub fn with_reactions(mut self, reactions: Vec<&'a ReactionEvent>) -> Self {
        self.reactions = reactions;
        self
    }
}

/// Trait for rendering backends.
pub trait Renderer {
    /// Produce a frame from the current canvas state.
    fn render(&mut self, ctx: &RenderContext);
}

/// Renders each frame to an SVG document held in memory.
#[derive(Debug, Default)]
pub struct SvgRenderer {
    frame: String,
    frame_count: u64,
}

impl SvgRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent frame.
    pub fn frame(&self) -> &str {
        &self.frame
    }

    /// Number of frames rendered so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

impl Renderer for SvgRenderer {
    fn render(&mut self, ctx: &RenderContext) {
        let canvas = ctx.canvas;
        let mut out = String::from(r#"<svg xmlns="http://www.w3.org/2000/svg">"#);
        out.push('\n');

        for shape in canvas.document.shapes_ordered() {
            render_shape(&mut out, shape, canvas.is_selected(shape.id()));
        }
        if let Some(preview) = canvas.tool_manager.preview_shape() {
            render_shape(&mut out, &preview, false);
        }
        for thread in ctx.threads {
            out.push_str(&format!(
                r#"  <circle class="thread" data-thread="{}" cx="{}" cy="{}" r="12" fill="{}"/>"#,
                thread.id,
                thread.x,
                thread.y,
                if thread.resolved { "#9ca3af" } else { "#facc15" }
            ));
            out.push('\n');
        }
        for reaction in &ctx.reactions {
            out.push_str(&format!(
                r#"  <text class="reaction" x="{}" y="{}">{}</text>"#,
                reaction.x,
                reaction.y,
                escape_xml(&reaction.value)
            ));
            out.push('\n');
        }
        for (connection_id, cursor) in &ctx.cursors {
            out.push_str(&format!(
                r#"  <circle class="cursor" data-connection="{}" cx="{}" cy="{}" r="4"/>"#,
                escape_xml(connection_id),
                cursor.x,
                cursor.y
            ));
            out.push('\n');
        }

        out.push_str("</svg>\n");
        self.frame = out;
        self.frame_count += 1;
    }
}

fn render_shape(out: &mut String, shape: &Shape, selected: bool) {
    let style = shape.style();
    let mut attrs = format!(r#"data-id="{}" {}"#, shape.id(), paint_attrs(style));
    if selected {
        attrs.push_str(r#" data-selected="true""#);
    }
    let rotation = shape.rotation();
    if rotation != 0.0 {
        let c = shape.bounds().center();
        attrs.push_str(&format!(
            r#" transform="rotate({} {} {})""#,
            rotation.to_degrees(),
            c.x,
            c.y
        ));
    }

    let element = match shape {
        Shape::Rectangle(r) => format!(
            r#"<rect x="{}" y="{}" width="{}" height="{}" rx="{}" {}/>"#,
            r.position.x, r.position.y, r.width, r.height, r.corner_radius, attrs
        ),
        Shape::Ellipse(e) => format!(
            r#"<ellipse cx="{}" cy="{}" rx="{}" ry="{}" {}/>"#,
            e.center.x, e.center.y, e.radius_x, e.radius_y, attrs
        ),
        Shape::Triangle(t) => format!(
            r#"<polygon points="{}" {}/>"#,
            points_attr(&t.vertices()),
            attrs
        ),
        Shape::Line(l) => format!(
            r#"<line x1="{}" y1="{}" x2="{}" y2="{}" {}/>"#,
            l.start.x, l.start.y, l.end.x, l.end.y, attrs
        ),
        Shape::Freehand(f) => format!(
            r#"<polyline points="{}" {}/>"#,
            points_attr(&f.points),
            attrs
        ),
        Shape::Text(t) => format!(
            r#"<text x="{}" y="{}" font-family="{}" font-size="{}" font-weight="{}" dominant-baseline="hanging" {}>{}</text>"#,
            t.position.x,
            t.position.y,
            escape_xml(&t.font_family),
            t.font_size,
            t.font_weight.css_weight(),
            attrs,
            escape_xml(&t.content)
        ),
        Shape::Image(i) => format!(
            r#"<image x="{}" y="{}" width="{}" height="{}" href="{}" {}/>"#,
            i.position.x,
            i.position.y,
            i.width,
            i.height,
            escape_xml(&i.src),
            attrs
        ),
    };
    out.push_str("  ");
    out.push_str(&element);
    out.push('\n');

    if selected {
        let b = shape.bounds();
        out.push_str(&format!(
            r#"  <rect class="selection" x="{}" y="{}" width="{}" height="{}" fill="none" stroke="{}"/>"#,
            b.x0,
            b.y0,
            b.width(),
            b.height(),
            SELECTION_COLOR
        ));
        out.push('\n');
    }
}

fn paint_attrs(style: &ShapeStyle) -> String {
    let fill = style
        .fill_color
        .map(|c| c.to_hex())
        .unwrap_or_else(|| "none".to_string());
    format!(
        r#"stroke="{}" stroke-width="{}" fill="{}" opacity="{}""#,
        style.stroke_color.to_hex(),
        style.stroke_width,
        fill,
        style.opacity
    )
}

fn points_attr(points: &[kurbo::Point]) -> String {
    points
        .iter()
        .map(|p| format!("{},{}", p.x, p.y))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Escape special XML characters
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapes::{Ellipse, Rectangle, Text};
    use kurbo::Point;

    #[test]
    fn test_shapes_rendered_in_z_order() {
        let mut canvas = Canvas::new();
        let back = Shape::Rectangle(Rectangle::new(Point::ZERO, 10.0, 10.0));
        let front = Shape::Ellipse(Ellipse::circle(Point::new(5.0, 5.0), 3.0));
        let (back_id, front_id) = (back.id(), front.id());
        canvas.document.add_shape(back);
        canvas.document.add_shape(front);

        let mut renderer = SvgRenderer::new();
        renderer.render(&RenderContext::new(&canvas));
        let svg = renderer.frame();

        let back_pos = svg.find(&back_id.to_string()).unwrap();
        let front_pos = svg.find(&front_id.to_string()).unwrap();
        assert!(back_pos < front_pos);
        assert_eq!(renderer.frame_count(), 1);
    }

    #[test]
    fn test_selected_shape_is_marked() {
        let mut canvas = Canvas::new();
        let shape = Shape::Rectangle(Rectangle::new(Point::ZERO, 10.0, 10.0));
        let id = shape.id();
        canvas.document.add_shape(shape);
        canvas.select(id);

        let mut renderer = SvgRenderer::new();
        renderer.render(&RenderContext::new(&canvas));
        assert!(renderer.frame().contains(r#"data-selected="true""#));
        assert!(renderer.frame().contains(r#"class="selection""#));
    }

    #[test]
    fn test_text_is_escaped() {
        let mut canvas = Canvas::new();
        canvas
            .document
            .add_shape(Shape::Text(Text::new(Point::ZERO, "a < b & c".to_string())));

        let mut renderer = SvgRenderer::new();
        renderer.render(&RenderContext::new(&canvas));
        assert!(renderer.frame().contains("a &lt; b &amp; c"));
    }

    #[test]
    fn test_cursors_and_reactions() {
        let canvas = Canvas::new();
        let reaction = ReactionEvent {
            x: 1.0,
            y: 2.0,
            value: "👍".to_string(),
        };
        let ctx = RenderContext::new(&canvas)
            .with_cursors(vec![("peer-1", CursorPosition { x: 3.0, y: 4.0 })])
            .with_reactions(vec![&reaction]);

        let mut renderer = SvgRenderer::new();
        renderer.render(&ctx);
        assert!(renderer.frame().contains(r#"data-connection="peer-1""#));
        assert!(renderer.frame().contains("👍"));
    }
}
