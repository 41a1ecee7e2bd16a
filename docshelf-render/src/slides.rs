//! Slide extraction from XML slide-deck containers (`.pptx`).
//!
//! A deck is a zip archive of XML parts. One pass over the ordered
//! slide list produces the full sequence of [`Slide`] records before
//! anything is delivered; decks are small enough that there is no
//! paging. Per slide, the text of every text-bearing shape is
//! concatenated (whitespace-only shapes dropped, shapes separated by a
//! blank line) and the bytes of the first image-bearing shape are
//! captured. Further images on the same slide are ignored on purpose.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{instrument, warn};
use zip::ZipArchive;

#[derive(Debug, Clone)]
pub struct Slide {
    /// 1-based position in the deck.
    pub number: usize,
    pub text: String,
    pub first_image: Option<Vec<u8>>,
}

/// Extracts the ordered slide sequence from the deck at `path`.
///
/// An unopenable container or a parse failure partway through yields an
/// empty sequence; callers treat an empty result as the error display
/// state for decks that were expected to have content.
#[instrument]
pub fn extract_slides(path: &Path) -> Vec<Slide> {
    match extract_slides_inner(path) {
        Ok(slides) => slides,
        Err(err) => {
            warn!(?err, path = %path.display(), "failed to extract slides");
            Vec::new()
        }
    }
}

/// Runs [`extract_slides`] on a blocking worker; container parsing is
/// not guaranteed fast enough for an interactive thread.
pub async fn extract_slides_async(path: PathBuf) -> Vec<Slide> {
    tokio::task::spawn_blocking(move || extract_slides(&path))
        .await
        .unwrap_or_else(|err| {
            warn!(?err, "slide extraction task failed");
            Vec::new()
        })
}

fn extract_slides_inner(path: &Path) -> Result<Vec<Slide>> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("{:?} is not a zip container", path))?;

    let presentation_rels = read_part(&mut archive, "ppt/_rels/presentation.xml.rels")?;
    let rels = parse_relationships(&presentation_rels)?;

    let presentation = read_part(&mut archive, "ppt/presentation.xml")?;
    let slide_ids = parse_slide_order(&presentation)?;

    let mut slides = Vec::with_capacity(slide_ids.len());
    for (position, rel_id) in slide_ids.iter().enumerate() {
        let target = rels
            .get(rel_id)
            .ok_or_else(|| anyhow!("unresolved slide relationship {rel_id}"))?;
        let slide_part = resolve_part("ppt", target);

        let slide_xml = read_part(&mut archive, &slide_part)?;
        let content = parse_slide_content(&slide_xml)
            .with_context(|| format!("failed to parse slide part {slide_part}"))?;

        let first_image = match content.first_image_rel {
            Some(image_rel) => load_slide_image(&mut archive, &slide_part, &image_rel),
            None => None,
        };

        slides.push(Slide {
            number: position + 1,
            text: content.text,
            first_image,
        });
    }

    Ok(slides)
}

fn read_part<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
    let mut part = archive
        .by_name(name)
        .with_context(|| format!("missing container part {name}"))?;
    let mut buf = Vec::new();
    part.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Joins a relationship target onto the directory of the referencing
/// part, folding `..` segments (targets like `../media/image1.png` are
/// relative to the slide directory).
fn resolve_part(base_dir: &str, target: &str) -> String {
    let mut segments: Vec<&str> = base_dir.split('/').filter(|s| !s.is_empty()).collect();
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// `Id -> Target` map from a `.rels` part.
fn parse_relationships(xml: &[u8]) -> Result<HashMap<String, String>> {
    let mut reader = Reader::from_reader(xml);
    let mut map = HashMap::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                let id = attribute_value(&e, |key| key == b"Id")?;
                let target = attribute_value(&e, |key| key == b"Target")?;
                if let (Some(id), Some(target)) = (id, target) {
                    map.insert(id, target);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(map)
}

/// Relationship ids of the deck's slides, in presentation order
/// (`p:sldIdLst` children of `ppt/presentation.xml`).
fn parse_slide_order(xml: &[u8]) -> Result<Vec<String>> {
    let mut reader = Reader::from_reader(xml);
    let mut order = Vec::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sldId" => {
                if let Some(rel_id) = attribute_value(&e, |key| key == b"r:id")? {
                    order.push(rel_id);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(order)
}

struct SlideContent {
    text: String,
    first_image_rel: Option<String>,
}

/// Walks one slide part. Text accumulates per `txBody` (paragraph
/// breaks become newlines, whitespace-only bodies are dropped) and the
/// shape texts are joined with a blank line. The first `blip` inside a
/// picture shape supplies the image relationship.
fn parse_slide_content(xml: &[u8]) -> Result<SlideContent> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut shape_texts: Vec<String> = Vec::new();
    let mut current_body: Option<String> = None;
    let mut in_text_run = false;
    let mut picture_depth = 0usize;
    let mut first_image_rel: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"txBody" => current_body = Some(String::new()),
                b"t" => in_text_run = current_body.is_some(),
                b"pic" => picture_depth += 1,
                b"blip" => capture_blip(&e, picture_depth, &mut first_image_rel)?,
                _ => {}
            },
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"blip" {
                    capture_blip(&e, picture_depth, &mut first_image_rel)?;
                }
            }
            Event::Text(t) => {
                if in_text_run {
                    if let Some(body) = current_body.as_mut() {
                        body.push_str(&t.unescape()?);
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_text_run = false,
                b"p" => {
                    if let Some(body) = current_body.as_mut() {
                        body.push('\n');
                    }
                }
                b"txBody" => {
                    if let Some(body) = current_body.take() {
                        let trimmed = body.trim();
                        if !trimmed.is_empty() {
                            shape_texts.push(trimmed.to_string());
                        }
                    }
                }
                b"pic" => picture_depth = picture_depth.saturating_sub(1),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(SlideContent {
        text: shape_texts.join("\n\n"),
        first_image_rel,
    })
}

fn capture_blip(
    element: &BytesStart<'_>,
    picture_depth: usize,
    first_image_rel: &mut Option<String>,
) -> Result<()> {
    if picture_depth == 0 || first_image_rel.is_some() {
        return Ok(());
    }
    if let Some(rel_id) = attribute_value(element, |key| key == b"r:embed")? {
        *first_image_rel = Some(rel_id);
    }
    Ok(())
}

fn attribute_value(
    element: &BytesStart<'_>,
    matches: impl Fn(&[u8]) -> bool,
) -> Result<Option<String>> {
    for attribute in element.attributes() {
        let attribute = attribute?;
        if matches(attribute.key.as_ref()) {
            return Ok(Some(attribute.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// Resolves an image relationship through the slide's own `.rels` part
/// and reads the referenced media bytes. Any failure degrades to "no
/// image" for that slide rather than failing the whole deck.
fn load_slide_image<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    slide_part: &str,
    image_rel: &str,
) -> Option<Vec<u8>> {
    let (slide_dir, slide_name) = slide_part.rsplit_once('/')?;
    let rels_part = format!("{slide_dir}/_rels/{slide_name}.rels");

    let result = read_part(archive, &rels_part)
        .and_then(|xml| parse_relationships(&xml))
        .and_then(|rels| {
            let target = rels
                .get(image_rel)
                .ok_or_else(|| anyhow!("unresolved image relationship {image_rel}"))?;
            read_part(archive, &resolve_part(slide_dir, target))
        });

    match result {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            warn!(?err, slide = slide_part, "failed to load slide image");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    const PRESENTATION: &str = r#"<?xml version="1.0"?>
<p:presentation xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main"
                xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">
  <p:sldIdLst>
    <p:sldId id="256" r:id="rId2"/>
    <p:sldId id="257" r:id="rId1"/>
  </p:sldIdLst>
</p:presentation>"#;

    const PRESENTATION_RELS: &str = r#"<?xml version="1.0"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
  <Relationship Id="rId1" Type="slide" Target="slides/slide2.xml"/>
  <Relationship Id="rId2" Type="slide" Target="slides/slide1.xml"/>
</Relationships>"#;

    const SLIDE_ONE: &str = r#"<?xml version="1.0"?>
<p:sld xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main"
       xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main"
       xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">
  <p:cSld><p:spTree>
    <p:sp><p:txBody>
      <a:p><a:r><a:t>Hello</a:t></a:r><a:r><a:t> world</a:t></a:r></a:p>
      <a:p><a:r><a:t>Second paragraph &amp; more</a:t></a:r></a:p>
    </p:txBody></p:sp>
    <p:sp><p:txBody><a:p><a:r><a:t>   </a:t></a:r></a:p></p:txBody></p:sp>
    <p:sp><p:txBody><a:p><a:r><a:t>Another shape</a:t></a:r></a:p></p:txBody></p:sp>
    <p:pic><p:blipFill><a:blip r:embed="rIdImg1"/></p:blipFill></p:pic>
    <p:pic><p:blipFill><a:blip r:embed="rIdImg2"/></p:blipFill></p:pic>
  </p:spTree></p:cSld>
</p:sld>"#;

    const SLIDE_ONE_RELS: &str = r#"<?xml version="1.0"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
  <Relationship Id="rIdImg1" Type="image" Target="../media/image1.png"/>
  <Relationship Id="rIdImg2" Type="image" Target="../media/image2.png"/>
</Relationships>"#;

    const SLIDE_TWO: &str = r#"<?xml version="1.0"?>
<p:sld xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main"
       xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main">
  <p:cSld><p:spTree>
    <p:sp><p:txBody><a:p><a:r><a:t>Closing slide</a:t></a:r></a:p></p:txBody></p:sp>
  </p:spTree></p:cSld>
</p:sld>"#;

    fn write_deck(path: &Path) {
        let file = File::create(path).unwrap();
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default();

        let parts: [(&str, &[u8]); 6] = [
            ("ppt/presentation.xml", PRESENTATION.as_bytes()),
            ("ppt/_rels/presentation.xml.rels", PRESENTATION_RELS.as_bytes()),
            ("ppt/slides/slide1.xml", SLIDE_ONE.as_bytes()),
            ("ppt/slides/_rels/slide1.xml.rels", SLIDE_ONE_RELS.as_bytes()),
            ("ppt/slides/slide2.xml", SLIDE_TWO.as_bytes()),
            ("ppt/media/image1.png", b"png-one"),
        ];
        for (name, contents) in parts {
            zip.start_file(name, options).unwrap();
            zip.write_all(contents).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn slides_come_out_in_presentation_order_with_one_based_numbers() {
        let dir = tempdir().unwrap();
        let deck = dir.path().join("deck.pptx");
        write_deck(&deck);

        let slides = extract_slides(&deck);
        assert_eq!(slides.len(), 2);
        assert_eq!(slides[0].number, 1);
        assert_eq!(slides[1].number, 2);
        // rId2 precedes rId1 in the slide id list, so slide1.xml is first.
        assert_eq!(slides[1].text, "Closing slide");
    }

    #[test]
    fn shape_texts_join_with_blank_lines_and_whitespace_shapes_drop() {
        let dir = tempdir().unwrap();
        let deck = dir.path().join("deck.pptx");
        write_deck(&deck);

        let slides = extract_slides(&deck);
        assert_eq!(
            slides[0].text,
            "Hello world\nSecond paragraph & more\n\nAnother shape"
        );
    }

    #[test]
    fn only_the_first_image_is_captured() {
        let dir = tempdir().unwrap();
        let deck = dir.path().join("deck.pptx");
        write_deck(&deck);

        let slides = extract_slides(&deck);
        assert_eq!(slides[0].first_image.as_deref(), Some(&b"png-one"[..]));
        assert!(slides[1].first_image.is_none());
    }

    #[test]
    fn unresolvable_image_degrades_to_no_image() {
        // image2.png is referenced by rIdImg2 but absent from the
        // archive; only rIdImg1 is ever resolved, so the deck parses.
        let dir = tempdir().unwrap();
        let deck = dir.path().join("deck.pptx");
        write_deck(&deck);

        assert_eq!(extract_slides(&deck).len(), 2);
    }

    #[test]
    fn corrupt_container_yields_zero_slides() {
        let dir = tempdir().unwrap();
        let deck = dir.path().join("broken.pptx");
        std::fs::write(&deck, b"this is not a zip archive").unwrap();

        assert!(extract_slides(&deck).is_empty());
    }

    #[test]
    fn missing_file_yields_zero_slides() {
        assert!(extract_slides(Path::new("/no/such/deck.pptx")).is_empty());
    }

    #[test]
    fn resolve_part_folds_parent_segments() {
        assert_eq!(resolve_part("ppt", "slides/slide1.xml"), "ppt/slides/slide1.xml");
        assert_eq!(
            resolve_part("ppt/slides", "../media/image1.png"),
            "ppt/media/image1.png"
        );
    }

    #[tokio::test]
    async fn async_extraction_matches_the_blocking_path() {
        let dir = tempdir().unwrap();
        let deck = dir.path().join("deck.pptx");
        write_deck(&deck);

        let slides = extract_slides_async(deck).await;
        assert_eq!(slides.len(), 2);
        assert_eq!(slides[0].number, 1);
    }
}
