use crate::error::ZapflowError;

/// 受信者名に置き換えられるプレースホルダ
pub const NAME_PLACEHOLDER: &str = "{nome}";

/// `{nome}` をすべて受信者名に置き換える。名前がなければ空文字にする。
pub fn render(template: &str, name: Option<&str>) -> String {
    template.replace(NAME_PLACEHOLDER, name.unwrap_or("").trim())
}

/// 位置 `index` の受信者に割り当てるバリエーションを返す（ラウンドロビン）。
pub fn select_variation(
    variations: &[String],
    index: usize,
) -> Result<(usize, &str), ZapflowError> {
    if variations.is_empty() {
        return Err(ZapflowError::InvalidTemplate(
            "at least one message variation is required".into(),
        ));
    }
    let i = index % variations.len();
    Ok((i, variations[i].as_str()))
}
