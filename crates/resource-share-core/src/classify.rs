//! File-type and category classification.
//!
//! A static lookup from a file extension to a [`FileType`] tag, and from the
//! tag to the display category stored on the resource record.

use std::path::Path;

/// Classification tag stored in the resource's `file_type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Image,
    Video,
    Audio,
    Pdf,
    Document,
    Archive,
    Software,
    Code,
    Ebook,
    Design,
    Font,
    Other,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Image => "image",
            FileType::Video => "video",
            FileType::Audio => "audio",
            FileType::Pdf => "pdf",
            FileType::Document => "document",
            FileType::Archive => "archive",
            FileType::Software => "software",
            FileType::Code => "code",
            FileType::Ebook => "ebook",
            FileType::Design => "design",
            FileType::Font => "font",
            FileType::Other => "other",
        }
    }

    /// Classifies a lowercase extension without the leading dot.
    pub fn from_extension(ext: &str) -> Self {
        match ext {
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" | "svg" | "ico" => FileType::Image,
            "mp4" | "webm" | "mkv" | "avi" | "mov" | "flv" | "wmv" => FileType::Video,
            "mp3" | "wav" | "flac" | "ogg" | "aac" | "m4a" => FileType::Audio,
            "pdf" => FileType::Pdf,
            "doc" | "docx" | "xls" | "xlsx" | "ppt" | "pptx" | "txt" | "rtf" | "md" => {
                FileType::Document
            }
            "zip" | "rar" | "7z" | "tar" | "gz" => FileType::Archive,
            "exe" | "msi" | "dmg" | "pkg" | "deb" | "apk" => FileType::Software,
            "go" | "py" | "js" | "java" | "c" | "cpp" | "h" | "cs" | "php" | "rb" | "html"
            | "css" | "json" | "xml" | "sql" => FileType::Code,
            "epub" | "mobi" | "azw" => FileType::Ebook,
            "psd" | "ai" | "sketch" | "fig" => FileType::Design,
            "ttf" | "otf" | "woff" | "woff2" => FileType::Font,
            _ => FileType::Other,
        }
    }

    /// Display category shown in listings.
    pub fn category(self) -> &'static str {
        match self {
            FileType::Image => "图片",
            FileType::Video => "视频",
            FileType::Audio => "音频",
            FileType::Pdf | FileType::Document => "文档",
            FileType::Archive => "压缩包",
            FileType::Software => "软件",
            FileType::Code => "代码",
            FileType::Ebook => "电子书",
            FileType::Design => "设计资源",
            FileType::Font => "字体",
            FileType::Other => "其他",
        }
    }
}

/// Lowercased extension of `file_name`, restricted to ASCII alphanumerics.
///
/// The result is safe to append to a generated file name on disk; anything
/// else (no extension, odd characters, very long suffixes) yields `None`.
pub fn normalized_extension(file_name: &str) -> Option<String> {
    let ext = Path::new(file_name).extension()?.to_str()?;
    if ext.is_empty() || ext.len() > 16 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Classifies a declared file name by its extension.
pub fn file_type_for(file_name: &str) -> FileType {
    normalized_extension(file_name)
        .map(|ext| FileType::from_extension(&ext))
        .unwrap_or(FileType::Other)
}
